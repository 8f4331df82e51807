//! nusb-based USB transport implementation.

use nusb::transfer::{
    Buffer, Bulk, ControlIn, ControlOut, ControlType, In, Interrupt, Out, Recipient,
    TransferError,
};
use nusb::{Device, Endpoint, Interface, MaybeFuture, list_devices};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

use super::traits::{
    Completion, ControlSetup, TimerId, Transfer, TransferId, TransferStatus, TransportError,
    TransportEvent, UsbTransport,
};

/// How long to wait for a cancelled transfer to be reaped.
const CANCEL_REAP: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    BulkIn,
    BulkOut,
    InterruptIn,
    /// Control transfers run to completion at submit time.
    Control,
}

#[derive(Debug)]
struct Pending {
    id: TransferId,
    kind: PendingKind,
    endpoint: u8,
    requested: usize,
    timeout_ms: u32,
    deadline: Option<Instant>,
    timed_out: bool,
}

/// nusb-based USB transport.
pub struct NusbTransport {
    device: Device,
    interface: Option<Interface>,
    interface_number: u8,
    bulk_in: HashMap<u8, Endpoint<Bulk, In>>,
    bulk_out: HashMap<u8, Endpoint<Bulk, Out>>,
    interrupt_in: HashMap<u8, Endpoint<Interrupt, In>>,
    inflight: Option<Pending>,
    ready: VecDeque<Completion>,
    timers: Vec<(TimerId, Instant)>,
    next_id: u64,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    /// Open the first device matching any of the given VID/PID pairs.
    #[instrument(level = "info", skip(ids))]
    pub fn open_any(ids: &[(u16, u16)]) -> Result<Self, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        for device_info in devices {
            if ids.contains(&(device_info.vendor_id(), device_info.product_id())) {
                return Self::open_device_info(device_info);
            }
        }

        Err(TransportError::DeviceNotFound { vid: 0, pid: 0 })
    }

    /// Open a device with specific VID/PID.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open_with_ids(vid: u16, pid: u16) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        Self::open_device_info(device_info)
    }

    fn open_device_info(device_info: nusb::DeviceInfo) -> Result<Self, TransportError> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        Ok(Self {
            device,
            interface: None,
            interface_number: 0,
            bulk_in: HashMap::new(),
            bulk_out: HashMap::new(),
            interrupt_in: HashMap::new(),
            inflight: None,
            ready: VecDeque::new(),
            timers: Vec::new(),
            next_id: 1,
            vid,
            pid,
        })
    }

    fn interface(&self) -> Result<&Interface, TransportError> {
        self.interface
            .as_ref()
            .ok_or(TransportError::ClaimInterfaceFailed {
                interface: self.interface_number,
                message: "no interface claimed".into(),
            })
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn endpoint_error(ep_type: &str, address: u8) -> TransportError {
        TransportError::EndpointNotFound {
            ep_type: ep_type.into(),
            address,
        }
    }

    fn submit_bulk_in(&mut self, endpoint: u8, length: usize) -> Result<(), TransportError> {
        if !self.bulk_in.contains_key(&endpoint) {
            let ep = self
                .interface()?
                .endpoint::<Bulk, In>(endpoint)
                .map_err(|_| Self::endpoint_error("Bulk", endpoint))?;
            self.bulk_in.insert(endpoint, ep);
        }
        let ep = self
            .bulk_in
            .get_mut(&endpoint)
            .ok_or_else(|| Self::endpoint_error("Bulk", endpoint))?;
        let len = round_to_packet(length, ep.max_packet_size());
        let mut buf = ep.allocate(len);
        buf.set_requested_len(len);
        ep.submit(buf);
        Ok(())
    }

    fn submit_interrupt_in(&mut self, endpoint: u8, length: usize) -> Result<(), TransportError> {
        if !self.interrupt_in.contains_key(&endpoint) {
            let ep = self
                .interface()?
                .endpoint::<Interrupt, In>(endpoint)
                .map_err(|_| Self::endpoint_error("Interrupt", endpoint))?;
            self.interrupt_in.insert(endpoint, ep);
        }
        let ep = self
            .interrupt_in
            .get_mut(&endpoint)
            .ok_or_else(|| Self::endpoint_error("Interrupt", endpoint))?;
        let len = round_to_packet(length, ep.max_packet_size());
        let mut buf = ep.allocate(len);
        buf.set_requested_len(len);
        ep.submit(buf);
        Ok(())
    }

    fn submit_bulk_out(&mut self, endpoint: u8, data: Vec<u8>) -> Result<(), TransportError> {
        if !self.bulk_out.contains_key(&endpoint) {
            let ep = self
                .interface()?
                .endpoint::<Bulk, Out>(endpoint)
                .map_err(|_| Self::endpoint_error("Bulk", endpoint))?;
            self.bulk_out.insert(endpoint, ep);
        }
        let ep = self
            .bulk_out
            .get_mut(&endpoint)
            .ok_or_else(|| Self::endpoint_error("Bulk", endpoint))?;
        ep.submit(Buffer::from(data));
        Ok(())
    }

    fn run_control(
        &self,
        setup: ControlSetup,
        data: Option<Vec<u8>>,
        length: usize,
        timeout_ms: u32,
    ) -> Result<(TransferStatus, Vec<u8>, usize), TransportError> {
        let interface = self.interface()?;
        let timeout = if timeout_ms == 0 {
            Duration::from_secs(3600)
        } else {
            Duration::from_millis(timeout_ms as u64)
        };
        let control_type = match (setup.request_type >> 5) & 0x03 {
            0 => ControlType::Standard,
            1 => ControlType::Class,
            _ => ControlType::Vendor,
        };
        let recipient = match setup.request_type & 0x1f {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            _ => Recipient::Other,
        };

        let result = match data {
            Some(payload) => interface
                .control_out(
                    ControlOut {
                        control_type,
                        recipient,
                        request: setup.request,
                        value: setup.value,
                        index: setup.index,
                        data: &payload,
                    },
                    timeout,
                )
                .wait()
                .map(|()| (Vec::new(), payload.len())),
            None => interface
                .control_in(
                    ControlIn {
                        control_type,
                        recipient,
                        request: setup.request,
                        value: setup.value,
                        index: setup.index,
                        length: length as u16,
                    },
                    timeout,
                )
                .wait()
                .map(|bytes| {
                    let n = bytes.len();
                    (bytes, n)
                }),
        };

        Ok(match result {
            Ok((bytes, n)) => (TransferStatus::Completed, bytes, n),
            Err(TransferError::Cancelled) => (TransferStatus::TimedOut, Vec::new(), 0),
            Err(e) => {
                warn!(request = setup.request, value = setup.value, error = %e, "Control transfer failed");
                (TransferStatus::Error, Vec::new(), 0)
            }
        })
    }

    fn wait_endpoint(&mut self, wait: Duration) -> Option<nusb::transfer::Completion> {
        let pending = self.inflight.as_ref()?;
        match pending.kind {
            PendingKind::BulkIn => self
                .bulk_in
                .get_mut(&pending.endpoint)?
                .wait_next_complete(wait),
            PendingKind::BulkOut => self
                .bulk_out
                .get_mut(&pending.endpoint)?
                .wait_next_complete(wait),
            PendingKind::InterruptIn => self
                .interrupt_in
                .get_mut(&pending.endpoint)?
                .wait_next_complete(wait),
            PendingKind::Control => None,
        }
    }

    fn cancel_endpoint(&mut self) {
        let Some(pending) = self.inflight.as_ref() else {
            return;
        };
        match pending.kind {
            PendingKind::BulkIn => {
                if let Some(ep) = self.bulk_in.get_mut(&pending.endpoint) {
                    ep.cancel_all();
                }
            }
            PendingKind::BulkOut => {
                if let Some(ep) = self.bulk_out.get_mut(&pending.endpoint) {
                    ep.cancel_all();
                }
            }
            PendingKind::InterruptIn => {
                if let Some(ep) = self.interrupt_in.get_mut(&pending.endpoint) {
                    ep.cancel_all();
                }
            }
            PendingKind::Control => {}
        }
    }

    fn finish(&mut self, raw: nusb::transfer::Completion) -> Option<Completion> {
        let pending = self.inflight.take()?;
        let status = match raw.status {
            Ok(()) => TransferStatus::Completed,
            Err(TransferError::Cancelled) if pending.timed_out => TransferStatus::TimedOut,
            Err(TransferError::Cancelled) => TransferStatus::Cancelled,
            Err(e) => {
                warn!(endpoint = %format!("0x{:02X}", pending.endpoint), error = %e, "Transfer failed");
                TransferStatus::Error
            }
        };
        let (data, actual) = match pending.kind {
            PendingKind::BulkOut => (Vec::new(), raw.actual_len.min(pending.requested)),
            _ => {
                let n = raw.actual_len.min(pending.requested);
                (raw.buffer.iter().take(n).copied().collect::<Vec<u8>>(), n)
            }
        };
        debug!(id = pending.id, ?status, bytes = actual, "Transfer complete");
        Some(Completion {
            id: pending.id,
            status,
            data,
            actual_length: actual,
            requested_length: pending.requested,
        })
    }

    fn due_timer(&mut self, now: Instant) -> Option<TimerId> {
        let idx = self
            .timers
            .iter()
            .enumerate()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .min_by_key(|(_, (_, deadline))| *deadline)
            .map(|(i, _)| i)?;
        Some(self.timers.remove(idx).0)
    }
}

fn round_to_packet(length: usize, max_packet: usize) -> usize {
    if max_packet == 0 {
        return length.max(1);
    }
    length.max(1).div_ceil(max_packet) * max_packet
}

impl UsbTransport for NusbTransport {
    #[instrument(skip(self, transfer), fields(kind = transfer.kind(), len = transfer.requested_len()))]
    fn submit(&mut self, transfer: Transfer) -> Result<TransferId, TransportError> {
        if self.inflight.is_some() {
            return Err(TransportError::SlotBusy);
        }
        let id = self.alloc_id();
        let requested = transfer.requested_len();
        let timeout_ms = transfer.timeout_ms();
        let deadline = (timeout_ms > 0)
            .then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));

        let (kind, endpoint) = match transfer {
            Transfer::BulkIn {
                endpoint, length, ..
            } => {
                self.submit_bulk_in(endpoint, length)?;
                (PendingKind::BulkIn, endpoint)
            }
            Transfer::InterruptIn {
                endpoint, length, ..
            } => {
                self.submit_interrupt_in(endpoint, length)?;
                (PendingKind::InterruptIn, endpoint)
            }
            Transfer::BulkOut { endpoint, data, .. } => {
                self.submit_bulk_out(endpoint, data)?;
                (PendingKind::BulkOut, endpoint)
            }
            Transfer::ControlOut { setup, data, .. } => {
                let (status, _, actual) = self.run_control(setup, Some(data), 0, timeout_ms)?;
                self.ready.push_back(Completion {
                    id,
                    status,
                    data: Vec::new(),
                    actual_length: actual,
                    requested_length: requested,
                });
                (PendingKind::Control, 0)
            }
            Transfer::ControlIn { setup, length, .. } => {
                let (status, data, actual) = self.run_control(setup, None, length, timeout_ms)?;
                self.ready.push_back(Completion {
                    id,
                    status,
                    data,
                    actual_length: actual,
                    requested_length: requested,
                });
                (PendingKind::Control, 0)
            }
        };

        trace!(id, "Transfer submitted");
        self.inflight = Some(Pending {
            id,
            kind,
            endpoint,
            requested,
            timeout_ms,
            deadline,
            timed_out: false,
        });
        Ok(id)
    }

    fn cancel(&mut self, id: TransferId) -> Result<(), TransportError> {
        match self.inflight.as_ref() {
            Some(p) if p.id == id => {
                debug!(id, "Cancelling transfer");
                self.cancel_endpoint();
                Ok(())
            }
            _ => Err(TransportError::UnknownTransfer(id)),
        }
    }

    fn add_timeout(&mut self, duration: Duration) -> TimerId {
        let id = self.alloc_id();
        self.timers.push((id, Instant::now() + duration));
        id
    }

    fn cancel_timeout(&mut self, id: TimerId) {
        self.timers.retain(|(t, _)| *t != id);
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<TransportEvent>, TransportError> {
        if let Some(done) = self.ready.pop_front() {
            if self.inflight.as_ref().is_some_and(|p| p.id == done.id) {
                self.inflight = None;
            }
            return Ok(Some(TransportEvent::Transfer(done)));
        }

        let now = Instant::now();
        if let Some(timer) = self.due_timer(now) {
            return Ok(Some(TransportEvent::Timer(timer)));
        }

        let mut until = now + timeout;
        if let Some(first) = self.timers.iter().map(|(_, d)| *d).min() {
            until = until.min(first);
        }

        if self.inflight.is_some() {
            if let Some(deadline) = self.inflight.as_ref().and_then(|p| p.deadline) {
                until = until.min(deadline);
            }
            let wait = until.saturating_duration_since(Instant::now());
            if let Some(raw) = self.wait_endpoint(wait) {
                return Ok(self.finish(raw).map(TransportEvent::Transfer));
            }

            let expired = self
                .inflight
                .as_ref()
                .and_then(|p| p.deadline)
                .is_some_and(|d| d <= Instant::now());
            if expired {
                if let Some(p) = self.inflight.as_mut() {
                    debug!(id = p.id, timeout_ms = p.timeout_ms, "Transfer timed out");
                    p.timed_out = true;
                }
                self.cancel_endpoint();
                if let Some(raw) = self.wait_endpoint(CANCEL_REAP) {
                    return Ok(self.finish(raw).map(TransportEvent::Transfer));
                }
            }
        } else {
            std::thread::sleep(until.saturating_duration_since(Instant::now()));
        }

        Ok(self
            .due_timer(Instant::now())
            .map(TransportEvent::Timer))
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        let claimed = self.device.claim_interface(interface).wait().map_err(|e| {
            TransportError::ClaimInterfaceFailed {
                interface,
                message: e.to_string(),
            }
        })?;
        info!(interface, "Interface claimed");
        self.interface = Some(claimed);
        self.interface_number = interface;
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        if self.interface_number == interface {
            self.bulk_in.clear();
            self.bulk_out.clear();
            self.interrupt_in.clear();
            self.interface = None;
            debug!(interface, "Interface released");
        }
        Ok(())
    }

    fn reset_device(&mut self) -> Result<(), TransportError> {
        self.device
            .reset()
            .wait()
            .map_err(|e| TransportError::SubmitFailed(e.to_string()))
    }

    fn set_configuration(&mut self, configuration: u8) -> Result<(), TransportError> {
        self.device
            .set_configuration(configuration)
            .wait()
            .map_err(|e| TransportError::SubmitFailed(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        // nusb reports disconnection through transfer errors only.
        true
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
