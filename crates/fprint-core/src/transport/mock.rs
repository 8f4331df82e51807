//! Mock USB transport for testing.
//!
//! IN transfers are answered from a scripted reply queue; an IN transfer
//! with nothing scripted stays pending until it is cancelled. OUT
//! transfers complete on the next poll and are logged. Timers fire on a
//! virtual clock as soon as nothing else is ready.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{
    Completion, ControlSetup, TimerId, Transfer, TransferId, TransferStatus, TransportError,
    TransportEvent, UsbTransport,
};

/// Scripted answer to the next IN transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    Data(Vec<u8>),
    Status(TransferStatus),
}

/// A logged OUT transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockWrite {
    Bulk { endpoint: u8, data: Vec<u8> },
    Control { setup: ControlSetup, data: Vec<u8> },
}

impl MockWrite {
    pub fn data(&self) -> &[u8] {
        match self {
            MockWrite::Bulk { data, .. } | MockWrite::Control { data, .. } => data,
        }
    }
}

/// Mock transport for unit testing driver state machines.
///
/// Clones share the same state, so a test can keep a handle after moving
/// the transport into a device.
#[derive(Clone)]
pub struct MockTransport {
    /// Queued replies for IN transfers.
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    /// Statuses forced onto upcoming OUT transfers.
    write_failures: Arc<Mutex<VecDeque<TransferStatus>>>,
    /// Captured OUT transfers.
    write_log: Arc<Mutex<Vec<MockWrite>>>,
    /// Every submitted transfer, in order.
    transfer_log: Arc<Mutex<Vec<Transfer>>>,
    /// The single in-flight transfer.
    inflight: Arc<Mutex<Option<(TransferId, Transfer)>>>,
    /// Completions ready for delivery (cancellations).
    ready: Arc<Mutex<VecDeque<Completion>>>,
    timers: Arc<Mutex<VecDeque<(TimerId, Duration)>>>,
    timer_log: Arc<Mutex<Vec<Duration>>>,
    claimed: Arc<Mutex<Vec<u8>>>,
    resets: Arc<Mutex<u32>>,
    next_id: Arc<Mutex<u64>>,
    /// Simulated VID/PID.
    vid: u16,
    pid: u16,
    /// Whether device is "connected".
    connected: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_ids(0x0000, 0x0000)
    }

    pub fn with_ids(vid: u16, pid: u16) -> Self {
        Self {
            replies: Arc::new(Mutex::new(VecDeque::new())),
            write_failures: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            transfer_log: Arc::new(Mutex::new(Vec::new())),
            inflight: Arc::new(Mutex::new(None)),
            ready: Arc::new(Mutex::new(VecDeque::new())),
            timers: Arc::new(Mutex::new(VecDeque::new())),
            timer_log: Arc::new(Mutex::new(Vec::new())),
            claimed: Arc::new(Mutex::new(Vec::new())),
            resets: Arc::new(Mutex::new(0)),
            next_id: Arc::new(Mutex::new(1)),
            vid,
            pid,
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// Queue bytes to return on the next IN transfer.
    pub fn queue_read(&self, data: &[u8]) {
        self.lock_replies().push_back(MockReply::Data(data.to_vec()));
    }

    /// Queue a non-data outcome (timeout, error) for the next IN transfer.
    pub fn queue_status(&self, status: TransferStatus) {
        self.lock_replies().push_back(MockReply::Status(status));
    }

    /// Make the next OUT transfer finish with `status`.
    pub fn fail_next_write(&self, status: TransferStatus) {
        lock(&self.write_failures).push_back(status);
    }

    /// Replies not yet consumed.
    pub fn pending_replies(&self) -> usize {
        self.lock_replies().len()
    }

    /// Payloads of all captured writes, bulk and control.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        lock(&self.write_log)
            .iter()
            .map(|w| w.data().to_vec())
            .collect()
    }

    pub fn get_write_log(&self) -> Vec<MockWrite> {
        lock(&self.write_log).clone()
    }

    /// Captured control writes as `(wValue, payload)` pairs.
    pub fn control_writes(&self) -> Vec<(u16, Vec<u8>)> {
        lock(&self.write_log)
            .iter()
            .filter_map(|w| match w {
                MockWrite::Control { setup, data } => Some((setup.value, data.clone())),
                MockWrite::Bulk { .. } => None,
            })
            .collect()
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        lock(&self.transfer_log).clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        lock(&self.write_log).clear();
        lock(&self.transfer_log).clear();
    }

    /// Durations of every timer that has been scheduled.
    pub fn timers(&self) -> Vec<Duration> {
        lock(&self.timer_log).clone()
    }

    pub fn has_inflight(&self) -> bool {
        lock(&self.inflight).is_some()
    }

    pub fn claimed_interfaces(&self) -> Vec<u8> {
        lock(&self.claimed).clone()
    }

    pub fn reset_count(&self) -> u32 {
        *lock(&self.resets)
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *lock(&self.connected) = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        *lock(&self.connected) = true;
    }

    pub fn set_ids(&mut self, vid: u16, pid: u16) {
        self.vid = vid;
        self.pid = pid;
    }

    fn lock_replies(&self) -> std::sync::MutexGuard<'_, VecDeque<MockReply>> {
        lock(&self.replies)
    }

    fn complete_inflight(&self, id: TransferId, transfer: &Transfer) -> Option<Completion> {
        let requested = transfer.requested_len();
        if transfer.is_in() {
            let reply = self.lock_replies().pop_front()?;
            let completion = match reply {
                MockReply::Data(mut data) => {
                    data.truncate(requested);
                    Completion {
                        id,
                        status: TransferStatus::Completed,
                        actual_length: data.len(),
                        data,
                        requested_length: requested,
                    }
                }
                MockReply::Status(status) => Completion {
                    id,
                    status,
                    data: Vec::new(),
                    actual_length: 0,
                    requested_length: requested,
                },
            };
            return Some(completion);
        }

        let status = lock(&self.write_failures)
            .pop_front()
            .unwrap_or(TransferStatus::Completed);
        let actual = if status == TransferStatus::Completed {
            requested
        } else {
            0
        };
        Some(Completion {
            id,
            status,
            data: Vec::new(),
            actual_length: actual,
            requested_length: requested,
        })
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn submit(&mut self, transfer: Transfer) -> Result<TransferId, TransportError> {
        if !*lock(&self.connected) {
            return Err(TransportError::Disconnected);
        }
        let mut inflight = lock(&self.inflight);
        if inflight.is_some() {
            return Err(TransportError::SlotBusy);
        }

        let id = {
            let mut next = lock(&self.next_id);
            let id = *next;
            *next += 1;
            id
        };

        match &transfer {
            Transfer::BulkOut { endpoint, data, .. } => lock(&self.write_log).push(MockWrite::Bulk {
                endpoint: *endpoint,
                data: data.clone(),
            }),
            Transfer::ControlOut { setup, data, .. } => {
                lock(&self.write_log).push(MockWrite::Control {
                    setup: *setup,
                    data: data.clone(),
                })
            }
            _ => {}
        }
        lock(&self.transfer_log).push(transfer.clone());
        *inflight = Some((id, transfer));
        Ok(id)
    }

    fn cancel(&mut self, id: TransferId) -> Result<(), TransportError> {
        let mut inflight = lock(&self.inflight);
        match inflight.take() {
            Some((cur, transfer)) if cur == id => {
                lock(&self.ready).push_back(Completion {
                    id,
                    status: TransferStatus::Cancelled,
                    data: Vec::new(),
                    actual_length: 0,
                    requested_length: transfer.requested_len(),
                });
                Ok(())
            }
            other => {
                *inflight = other;
                Err(TransportError::UnknownTransfer(id))
            }
        }
    }

    fn add_timeout(&mut self, duration: Duration) -> TimerId {
        let mut next = lock(&self.next_id);
        let id = *next;
        *next += 1;
        lock(&self.timers).push_back((id, duration));
        lock(&self.timer_log).push(duration);
        id
    }

    fn cancel_timeout(&mut self, id: TimerId) {
        lock(&self.timers).retain(|(t, _)| *t != id);
    }

    fn poll(&mut self, _timeout: Duration) -> Result<Option<TransportEvent>, TransportError> {
        if let Some(done) = lock(&self.ready).pop_front() {
            return Ok(Some(TransportEvent::Transfer(done)));
        }

        let current = lock(&self.inflight).clone();
        if let Some((id, transfer)) = current {
            if let Some(done) = self.complete_inflight(id, &transfer) {
                *lock(&self.inflight) = None;
                return Ok(Some(TransportEvent::Transfer(done)));
            }
        }

        if let Some((id, _)) = lock(&self.timers).pop_front() {
            return Ok(Some(TransportEvent::Timer(id)));
        }
        Ok(None)
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        if !*lock(&self.connected) {
            return Err(TransportError::Disconnected);
        }
        lock(&self.claimed).push(interface);
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        lock(&self.claimed).retain(|i| *i != interface);
        Ok(())
    }

    fn reset_device(&mut self) -> Result<(), TransportError> {
        *lock(&self.resets) += 1;
        Ok(())
    }

    fn set_configuration(&mut self, _configuration: u8) -> Result<(), TransportError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *lock(&self.connected)
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLL: Duration = Duration::from_millis(10);

    #[test]
    fn test_mock_read_queue() {
        let mut mock = MockTransport::new();
        mock.queue_read(&[1, 2, 3, 4]);

        let id = mock.submit(Transfer::bulk_in(0x81, 2, 1000)).unwrap();
        match mock.poll(POLL).unwrap() {
            Some(TransportEvent::Transfer(c)) => {
                assert_eq!(c.id, id);
                assert_eq!(c.data, vec![1, 2]);
                assert_eq!(c.actual_length, 2);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Nothing scripted: the read stays pending
        mock.submit(Transfer::bulk_in(0x81, 2, 1000)).unwrap();
        assert!(mock.poll(POLL).unwrap().is_none());
        assert!(mock.has_inflight());
    }

    #[test]
    fn test_mock_write_capture() {
        let mut mock = MockTransport::new();
        mock.submit(Transfer::bulk_out(0x02, b"Hello".to_vec(), 1000))
            .unwrap();
        mock.poll(POLL).unwrap();
        mock.submit(Transfer::vendor_out(0x04, 0x4e, 0, vec![0x70], 1000))
            .unwrap();
        mock.poll(POLL).unwrap();

        let writes = mock.get_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], b"Hello");
        assert_eq!(mock.control_writes(), vec![(0x4e, vec![0x70])]);
    }

    #[test]
    fn test_mock_single_slot() {
        let mut mock = MockTransport::new();
        mock.submit(Transfer::bulk_in(0x81, 4, 0)).unwrap();
        assert!(matches!(
            mock.submit(Transfer::bulk_in(0x81, 4, 0)),
            Err(TransportError::SlotBusy)
        ));
    }

    #[test]
    fn test_mock_cancel_delivers_completion() {
        let mut mock = MockTransport::new();
        let id = mock.submit(Transfer::interrupt_in(0x83, 5, 0)).unwrap();
        mock.cancel(id).unwrap();
        match mock.poll(POLL).unwrap() {
            Some(TransportEvent::Transfer(c)) => {
                assert_eq!(c.id, id);
                assert_eq!(c.status, TransferStatus::Cancelled);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!mock.has_inflight());
    }

    #[test]
    fn test_mock_timers_fire_in_order() {
        let mut mock = MockTransport::new();
        let a = mock.add_timeout(Duration::from_millis(50));
        let b = mock.add_timeout(Duration::from_millis(10));
        mock.cancel_timeout(a);
        assert_eq!(mock.poll(POLL).unwrap(), Some(TransportEvent::Timer(b)));
        assert_eq!(mock.poll(POLL).unwrap(), None);
        assert_eq!(mock.timers().len(), 2);
    }

    #[test]
    fn test_mock_disconnect() {
        let mut mock = MockTransport::new();
        assert!(mock.is_connected());

        mock.disconnect();
        assert!(!mock.is_connected());
        assert!(mock.submit(Transfer::bulk_out(0x02, vec![0], 0)).is_err());
    }
}
