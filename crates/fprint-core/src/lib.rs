//! fprint-core: USB fingerprint imaging drivers in Rust.
//!
//! This crate drives swipe and press fingerprint sensors over USB and
//! hands standardized grayscale images to its caller.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Transport**: asynchronous USB transfer abstraction (nusb, mock)
//! - **SSM**: sequential state machines and the runner executing them
//! - **Assembling**: strip and line stitching into one image
//! - **ImgDev**: acquisition state, callbacks and activation lifecycle
//! - **Drivers**: one state machine family per sensor line
//! - **TLS**: secure channel used by the VFS0090 family
//! - **Events**: observer pattern for delivering callbacks upward
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use fprint_core::{DriverConfig, ImgDev, NusbTransport, TracingObserver};
//!
//! let transport = NusbTransport::open_with_ids(0x08ff, 0x2580)?;
//! let mut dev = ImgDev::open_with_transport(
//!     transport,
//!     &DriverConfig::default(),
//!     Arc::new(TracingObserver),
//! )?;
//! dev.activate()?;
//! loop {
//!     dev.handle_events(Duration::from_millis(100))?;
//! }
//! # Ok::<(), fprint_core::FpError>(())
//! ```

pub mod assembling;
pub mod config;
pub mod drivers;
pub mod error;
pub mod events;
pub mod image;
pub mod imgdev;
pub mod ssm;
pub mod tls;
pub mod transport;

// Re-exports for convenience
pub use config::{ConfigError, DriverConfig};
pub use drivers::{Driver, DriverKind};
pub use error::{FpError, ScanRetry};
pub use events::{FpEvent, ImgDevObserver, NullObserver, RecordingObserver, TracingObserver};
pub use image::{Image, ImageFlags};
pub use imgdev::{AcquireState, DriverInfo, ImageDriver, ImgDev};
pub use tls::TlsError;
pub use transport::{MockTransport, NusbTransport, TransportError, UsbTransport};
