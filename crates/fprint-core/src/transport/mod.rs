//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockReply, MockTransport, MockWrite};
pub use nusb::NusbTransport;
pub use traits::{
    Completion, ControlSetup, TimerId, Transfer, TransferId, TransferStatus, TransportError,
    TransportEvent, UsbTransport, VENDOR_IN, VENDOR_OUT,
};
