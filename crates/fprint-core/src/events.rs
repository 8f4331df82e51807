//! Event system for delivering device callbacks upward.
//!
//! Every callback an imaging device produces (finger status, captured
//! images, errors, phase completions) is an [`FpEvent`] handed to an
//! [`ImgDevObserver`], keeping clients decoupled from the runtime.

use std::fmt;
use std::sync::Mutex;

use crate::error::{FpError, ScanRetry};
use crate::image::Image;

/// Events emitted by an imaging device.
#[derive(Debug, Clone, PartialEq)]
pub enum FpEvent {
    OpenComplete { result: Result<(), FpError> },
    CloseComplete,
    ActivateComplete { result: Result<(), FpError> },
    DeactivateComplete,
    /// Finger placed or lifted. Only emitted on change.
    FingerStatus { present: bool },
    /// One per successful capture, already standardized.
    ImageCaptured { image: Image },
    /// Recoverable failure; the loop restarts after finger off.
    AbortScan { reason: ScanRetry },
    /// Unrecoverable failure; the client should deactivate.
    SessionError { error: FpError },
}

impl fmt::Display for FpEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FpEvent::OpenComplete { .. } => write!(f, "open_complete"),
            FpEvent::CloseComplete => write!(f, "close_complete"),
            FpEvent::ActivateComplete { .. } => write!(f, "activate_complete"),
            FpEvent::DeactivateComplete => write!(f, "deactivate_complete"),
            FpEvent::FingerStatus { .. } => write!(f, "report_finger_status"),
            FpEvent::ImageCaptured { .. } => write!(f, "image_captured"),
            FpEvent::AbortScan { .. } => write!(f, "abort_scan"),
            FpEvent::SessionError { .. } => write!(f, "session_error"),
        }
    }
}

/// Observer trait for receiving device events.
pub trait ImgDevObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &FpEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl ImgDevObserver for NullObserver {
    fn on_event(&self, _event: &FpEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl ImgDevObserver for TracingObserver {
    fn on_event(&self, event: &FpEvent) {
        match event {
            FpEvent::OpenComplete { result: Ok(()) } => tracing::info!("Device opened"),
            FpEvent::OpenComplete { result: Err(e) } => {
                tracing::error!(error = %e, "Device open failed")
            }
            FpEvent::CloseComplete => tracing::info!("Device closed"),
            FpEvent::ActivateComplete { result: Ok(()) } => tracing::info!("Device activated"),
            FpEvent::ActivateComplete { result: Err(e) } => {
                tracing::error!(error = %e, "Activation failed")
            }
            FpEvent::DeactivateComplete => tracing::info!("Device deactivated"),
            FpEvent::FingerStatus { present } => {
                tracing::info!(present = present, "Finger status")
            }
            FpEvent::ImageCaptured { image } => {
                tracing::info!(
                    width = image.width,
                    height = image.height,
                    "Image captured"
                )
            }
            FpEvent::AbortScan { reason } => tracing::warn!(reason = %reason, "Scan aborted"),
            FpEvent::SessionError { error } => tracing::error!(error = %error, "Session error"),
        }
    }
}

/// Observer that keeps every event, for tests and simple clients.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<FpEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FpEvent> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of recorded events with the given callback name.
    pub fn count(&self, name: &str) -> usize {
        self.lock()
            .iter()
            .filter(|e| e.to_string() == name)
            .count()
    }

    pub fn images(&self) -> Vec<Image> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                FpEvent::ImageCaptured { image } => Some(image.clone()),
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<FpEvent>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ImgDevObserver for RecordingObserver {
    fn on_event(&self, event: &FpEvent) {
        self.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_observer_counts() {
        let obs = RecordingObserver::new();
        obs.on_event(&FpEvent::FingerStatus { present: true });
        obs.on_event(&FpEvent::ImageCaptured {
            image: Image::new(2, 2),
        });
        obs.on_event(&FpEvent::FingerStatus { present: false });

        assert_eq!(obs.count("report_finger_status"), 2);
        assert_eq!(obs.images().len(), 1);
        obs.clear();
        assert!(obs.events().is_empty());
    }
}
