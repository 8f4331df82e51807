//! USB Transport layer abstraction.
//!
//! Defines the `UsbTransport` trait for asynchronous USB communication,
//! allowing different implementations (nusb, mock, etc.). Transfers are
//! submitted, then completed through [`UsbTransport::poll`], which also
//! delivers timer expirations. Everything runs on the caller's thread.

use std::time::Duration;
use thiserror::Error;

use crate::error::FpError;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, address=0x{address:02X}")]
    EndpointNotFound { ep_type: String, address: u8 },

    #[error("Submit failed: {0}")]
    SubmitFailed(String),

    #[error("A transfer is already in flight")]
    SlotBusy,

    #[error("Unknown transfer id {0}")]
    UnknownTransfer(u64),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TransferId = u64;
pub type TimerId = u64;

/// bmRequestType for vendor requests addressed to the device.
pub const VENDOR_OUT: u8 = 0x40;
pub const VENDOR_IN: u8 = 0xC0;

/// Setup packet fields of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlSetup {
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// One asynchronous transfer request. A zero timeout waits forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    BulkOut {
        endpoint: u8,
        data: Vec<u8>,
        timeout_ms: u32,
    },
    BulkIn {
        endpoint: u8,
        length: usize,
        timeout_ms: u32,
    },
    InterruptIn {
        endpoint: u8,
        length: usize,
        timeout_ms: u32,
    },
    ControlOut {
        setup: ControlSetup,
        data: Vec<u8>,
        timeout_ms: u32,
    },
    ControlIn {
        setup: ControlSetup,
        length: usize,
        timeout_ms: u32,
    },
}

impl Transfer {
    pub fn bulk_out(endpoint: u8, data: impl Into<Vec<u8>>, timeout_ms: u32) -> Self {
        Transfer::BulkOut {
            endpoint,
            data: data.into(),
            timeout_ms,
        }
    }

    pub fn bulk_in(endpoint: u8, length: usize, timeout_ms: u32) -> Self {
        Transfer::BulkIn {
            endpoint,
            length,
            timeout_ms,
        }
    }

    pub fn interrupt_in(endpoint: u8, length: usize, timeout_ms: u32) -> Self {
        Transfer::InterruptIn {
            endpoint,
            length,
            timeout_ms,
        }
    }

    /// Vendor request writing `data` to the device.
    pub fn vendor_out(
        request: u8,
        value: u16,
        index: u16,
        data: impl Into<Vec<u8>>,
        timeout_ms: u32,
    ) -> Self {
        Transfer::ControlOut {
            setup: ControlSetup {
                request_type: VENDOR_OUT,
                request,
                value,
                index,
            },
            data: data.into(),
            timeout_ms,
        }
    }

    /// Vendor request reading `length` bytes from the device.
    pub fn vendor_in(request: u8, value: u16, index: u16, length: usize, timeout_ms: u32) -> Self {
        Transfer::ControlIn {
            setup: ControlSetup {
                request_type: VENDOR_IN,
                request,
                value,
                index,
            },
            length,
            timeout_ms,
        }
    }

    /// Bytes the transfer is expected to move.
    pub fn requested_len(&self) -> usize {
        match self {
            Transfer::BulkOut { data, .. } | Transfer::ControlOut { data, .. } => data.len(),
            Transfer::BulkIn { length, .. }
            | Transfer::InterruptIn { length, .. }
            | Transfer::ControlIn { length, .. } => *length,
        }
    }

    pub fn timeout_ms(&self) -> u32 {
        match self {
            Transfer::BulkOut { timeout_ms, .. }
            | Transfer::BulkIn { timeout_ms, .. }
            | Transfer::InterruptIn { timeout_ms, .. }
            | Transfer::ControlOut { timeout_ms, .. }
            | Transfer::ControlIn { timeout_ms, .. } => *timeout_ms,
        }
    }

    pub fn is_in(&self) -> bool {
        matches!(
            self,
            Transfer::BulkIn { .. } | Transfer::InterruptIn { .. } | Transfer::ControlIn { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Transfer::BulkOut { .. } => "bulk-out",
            Transfer::BulkIn { .. } => "bulk-in",
            Transfer::InterruptIn { .. } => "interrupt-in",
            Transfer::ControlOut { .. } => "control-out",
            Transfer::ControlIn { .. } => "control-in",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    TimedOut,
    Cancelled,
    Error,
}

/// Result of a finished transfer, delivered through `poll`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub id: TransferId,
    pub status: TransferStatus,
    /// Received bytes for IN transfers, empty for OUT transfers.
    pub data: Vec<u8>,
    pub actual_length: usize,
    pub requested_length: usize,
}

impl Completion {
    /// Map the status onto the error taxonomy.
    pub fn check_status(&self) -> Result<(), FpError> {
        match self.status {
            TransferStatus::Completed => Ok(()),
            TransferStatus::TimedOut => Err(FpError::Timeout),
            TransferStatus::Cancelled => Err(FpError::Cancelled),
            TransferStatus::Error => Err(FpError::Transport(format!(
                "transfer {} failed after {} bytes",
                self.id, self.actual_length
            ))),
        }
    }

    /// Status is completed and every requested byte moved.
    pub fn check_full(&self) -> Result<&[u8], FpError> {
        self.check_status()?;
        if self.actual_length != self.requested_length {
            return Err(FpError::ShortTransfer {
                expected: self.requested_length,
                actual: self.actual_length,
            });
        }
        Ok(&self.data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Transfer(Completion),
    Timer(TimerId),
}

/// Abstract USB transport interface.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Mock implementation for unit testing
pub trait UsbTransport: Send {
    /// Queue a transfer; its completion arrives later through `poll`.
    fn submit(&mut self, transfer: Transfer) -> Result<TransferId, TransportError>;

    /// Best-effort cancellation. The completion is still delivered,
    /// with `TransferStatus::Cancelled` unless it already finished.
    fn cancel(&mut self, id: TransferId) -> Result<(), TransportError>;

    /// Schedule a single-shot timer.
    fn add_timeout(&mut self, duration: Duration) -> TimerId;

    /// Drop a pending timer. Unknown ids are ignored.
    fn cancel_timeout(&mut self, id: TimerId);

    /// Wait up to `timeout` for the next completion or timer expiry.
    fn poll(&mut self, timeout: Duration) -> Result<Option<TransportEvent>, TransportError>;

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError>;

    fn release_interface(&mut self, interface: u8) -> Result<(), TransportError>;

    fn reset_device(&mut self) -> Result<(), TransportError>;

    fn set_configuration(&mut self, configuration: u8) -> Result<(), TransportError>;

    /// Check if device is still connected.
    fn is_connected(&self) -> bool;

    fn vendor_id(&self) -> u16;

    fn product_id(&self) -> u16;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(status: TransferStatus, actual: usize, requested: usize) -> Completion {
        Completion {
            id: 1,
            status,
            data: vec![0; actual],
            actual_length: actual,
            requested_length: requested,
        }
    }

    #[test]
    fn test_check_full() {
        assert!(completion(TransferStatus::Completed, 4, 4).check_full().is_ok());
        assert_eq!(
            completion(TransferStatus::Completed, 2, 4).check_full(),
            Err(FpError::ShortTransfer {
                expected: 4,
                actual: 2
            })
        );
        assert_eq!(
            completion(TransferStatus::Cancelled, 0, 4).check_full(),
            Err(FpError::Cancelled)
        );
        assert_eq!(
            completion(TransferStatus::TimedOut, 0, 4).check_status(),
            Err(FpError::Timeout)
        );
    }

    #[test]
    fn test_vendor_request_direction() {
        let out = Transfer::vendor_out(0x04, 0x4e, 0, vec![0x70], 5000);
        let inb = Transfer::vendor_in(0x04, 0x07, 0, 1, 5000);
        assert!(!out.is_in());
        assert!(inb.is_in());
        match inb {
            Transfer::ControlIn { setup, .. } => assert!(setup.is_in()),
            _ => unreachable!(),
        }
        assert_eq!(out.requested_len(), 1);
    }
}
