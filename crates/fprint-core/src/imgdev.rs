//! Imaging device host.
//!
//! [`ImgDev`] owns a transport, one family [`Driver`] and the [`SsmRunner`]
//! that executes the driver's machines. It tracks the acquisition state,
//! delivers callbacks to the observer and turns deactivation into exactly
//! one `deactivate_complete`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::config::DriverConfig;
use crate::drivers::{Driver, DriverKind};
use crate::error::{FpError, Result, ScanRetry};
use crate::events::{FpEvent, ImgDevObserver};
use crate::image::Image;
use crate::ssm::{Ssm, SsmHandler, SsmRunner, Step};
use crate::transport::{Completion, UsbTransport};

/// Static description of a driver family.
#[derive(Debug)]
pub struct DriverInfo {
    pub name: &'static str,
    pub full_name: &'static str,
    pub id_table: &'static [(u16, u16)],
    /// Fixed output width; `None` when the driver sets it per image.
    pub img_width: Option<usize>,
    pub img_height: Option<usize>,
    /// Match threshold hint for downstream consumers.
    pub bz3_threshold: Option<u32>,
    pub interface: u8,
}

impl DriverInfo {
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.id_table.contains(&(vid, pid))
    }
}

/// Acquisition progress as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireState {
    Idle,
    Activating,
    AwaitFingerOn,
    AwaitImage,
    AwaitFingerOff,
    Deactivating,
}

/// Per-family device logic driven by the host.
///
/// Machines returned from these hooks are run by the host's runner; the
/// driver is told about each finished root machine through
/// [`ImageDriver::machine_done`] and may chain the next one from there.
pub trait ImageDriver {
    fn info(&self) -> &'static DriverInfo;

    /// Device-initial handshake. `None` means the device is ready at once.
    fn open(&mut self, _host: &mut Host) -> Result<Option<Ssm>> {
        Ok(None)
    }

    /// First machine of an activation.
    fn activate(&mut self, host: &mut Host) -> Result<Ssm>;

    /// Deactivation requested while nothing runs. May return a deinit tail.
    fn deactivate(&mut self, _host: &mut Host) -> Option<Ssm> {
        None
    }

    fn run_state(&mut self, ssm: &Ssm, host: &mut Host) -> Step;

    fn transfer_done(&mut self, _ssm: &Ssm, completion: Completion, _host: &mut Host) -> Step {
        Step::from_result(completion.check_status())
    }

    fn timer_done(&mut self, _ssm: &Ssm, _host: &mut Host) -> Step {
        Step::Next
    }

    /// A root machine finished; return the next one to run, if any.
    fn machine_done(&mut self, ssm: Ssm, host: &mut Host) -> Option<Ssm>;

    fn close(&mut self, _host: &mut Host) {}
}

/// Host-side state handed to driver hooks.
pub struct Host {
    observer: Arc<dyn ImgDevObserver>,
    info: &'static DriverInfo,
    state: AcquireState,
    deactivating: bool,
    opened: bool,
}

impl Host {
    fn new(info: &'static DriverInfo, observer: Arc<dyn ImgDevObserver>) -> Self {
        Self {
            observer,
            info,
            state: AcquireState::Idle,
            deactivating: false,
            opened: false,
        }
    }

    pub fn state(&self) -> AcquireState {
        self.state
    }

    /// Deactivation was requested; machines should wind down.
    pub fn is_deactivating(&self) -> bool {
        self.deactivating
    }

    fn emit(&self, event: FpEvent) {
        self.observer.on_event(&event);
    }

    pub fn open_complete(&mut self, result: Result<()>) {
        self.opened = result.is_ok();
        self.emit(FpEvent::OpenComplete { result });
    }

    pub fn activate_complete(&mut self, result: Result<()>) {
        debug!(ok = result.is_ok(), "Activation complete");
        if result.is_ok() && !self.deactivating {
            self.state = AcquireState::AwaitFingerOn;
        }
        self.emit(FpEvent::ActivateComplete { result });
    }

    /// Edge-triggered finger report. Presence only counts while waiting
    /// for a finger, removal only while waiting for it to leave.
    pub fn report_finger_status(&mut self, present: bool) {
        debug!(present, state = ?self.state, "Finger status");
        match (present, self.state) {
            (true, AcquireState::AwaitFingerOn) => {
                self.state = AcquireState::AwaitImage;
                self.emit(FpEvent::FingerStatus { present: true });
            }
            (false, AcquireState::AwaitFingerOff) => {
                self.state = AcquireState::AwaitFingerOn;
                self.emit(FpEvent::FingerStatus { present: false });
            }
            _ => debug!("Ignoring status report"),
        }
    }

    /// Hand over an assembled image. The image is validated, the driver's
    /// fixed dimensions applied and the orientation standardized.
    pub fn image_captured(&mut self, mut image: Image) {
        if self.state != AcquireState::AwaitImage {
            debug!(state = ?self.state, "Ignoring image in current state");
            return;
        }
        self.state = AcquireState::AwaitFingerOff;

        if let Some(width) = self.info.img_width {
            image.width = width;
        }
        if let Some(height) = self.info.img_height {
            image.height = height;
        }
        if !image.is_sane() {
            warn!(
                width = image.width,
                height = image.height,
                len = image.data.len(),
                "Image is not sane"
            );
            self.emit(FpEvent::SessionError {
                error: FpError::protocol("assembled image is not sane"),
            });
            return;
        }

        image.standardize();
        info!(width = image.width, height = image.height, "Image captured");
        self.emit(FpEvent::ImageCaptured { image });
    }

    /// Recoverable capture failure; the next finger-off re-arms the loop.
    pub fn abort_scan(&mut self, reason: ScanRetry) {
        if matches!(self.state, AcquireState::AwaitFingerOn | AcquireState::AwaitImage) {
            self.state = AcquireState::AwaitFingerOff;
        }
        self.emit(FpEvent::AbortScan { reason });
    }

    /// Fatal failure. Cancellation never surfaces here and capture
    /// errors are routed to `abort_scan`.
    pub fn session_error(&mut self, error: FpError) {
        if error.is_cancelled() {
            return;
        }
        if let Some(reason) = error.scan_retry() {
            self.abort_scan(reason);
            return;
        }
        self.emit(FpEvent::SessionError { error });
    }
}

#[cfg(test)]
impl Host {
    pub(crate) fn for_tests(info: &'static DriverInfo, observer: Arc<dyn ImgDevObserver>) -> Self {
        Self::new(info, observer)
    }

    pub(crate) fn force_state(&mut self, state: AcquireState) {
        self.state = state;
    }
}

/// Borrows the driver and the host separately for one runner call.
struct Dispatch<'a> {
    driver: &'a mut dyn ImageDriver,
    host: &'a mut Host,
}

impl SsmHandler for Dispatch<'_> {
    fn run_state(&mut self, ssm: &Ssm) -> Step {
        self.driver.run_state(ssm, self.host)
    }

    fn transfer_done(&mut self, ssm: &Ssm, completion: Completion) -> Step {
        self.driver.transfer_done(ssm, completion, self.host)
    }

    fn timer_done(&mut self, ssm: &Ssm) -> Step {
        self.driver.timer_done(ssm, self.host)
    }

    fn machine_done(&mut self, ssm: Ssm) -> Option<Ssm> {
        self.driver.machine_done(ssm, self.host)
    }
}

/// An opened imaging device.
pub struct ImgDev<T: UsbTransport> {
    transport: T,
    driver: Driver,
    runner: SsmRunner,
    host: Host,
}

impl<T: UsbTransport> ImgDev<T> {
    /// Select the driver matching the transport's IDs and open it.
    #[instrument(skip_all, fields(
        vendor_id = %format!("{:04X}", transport.vendor_id()),
        product_id = %format!("{:04X}", transport.product_id()),
    ))]
    pub fn open_with_transport(
        transport: T,
        config: &DriverConfig,
        observer: Arc<dyn ImgDevObserver>,
    ) -> Result<Self> {
        let (vid, pid) = (transport.vendor_id(), transport.product_id());
        let kind = DriverKind::from_ids(vid, pid).ok_or_else(|| {
            FpError::Resource(format!("no driver for {:04x}:{:04x}", vid, pid))
        })?;
        Self::open(kind, transport, config, observer)
    }

    /// Open the device with an explicit driver family.
    pub fn open(
        kind: DriverKind,
        mut transport: T,
        config: &DriverConfig,
        observer: Arc<dyn ImgDevObserver>,
    ) -> Result<Self> {
        let mut driver = kind.create(config, transport.vendor_id(), transport.product_id())?;
        let info = driver.as_dyn().info();
        info!(driver = info.name, "Opening {}", info.full_name);

        transport.claim_interface(info.interface)?;

        let mut dev = Self {
            transport,
            driver,
            runner: SsmRunner::new(),
            host: Host::new(info, observer),
        };

        match dev.driver.as_dyn().open(&mut dev.host)? {
            Some(ssm) => dev.start(ssm)?,
            None => dev.host.open_complete(Ok(())),
        }
        Ok(dev)
    }

    pub fn info(&self) -> &'static DriverInfo {
        self.host.info
    }

    pub fn state(&self) -> AcquireState {
        self.host.state
    }

    pub fn is_opened(&self) -> bool {
        self.host.opened
    }

    pub fn is_idle(&self) -> bool {
        self.runner.is_idle()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Start capturing. `activate_complete` follows asynchronously.
    pub fn activate(&mut self) -> Result<()> {
        if !self.runner.is_idle() {
            return Err(FpError::Resource("device is busy".into()));
        }
        self.host.deactivating = false;
        self.host.state = AcquireState::Activating;
        let ssm = self.driver.as_dyn().activate(&mut self.host)?;
        self.start(ssm)
    }

    /// Stop capturing. `deactivate_complete` is emitted exactly once, as
    /// soon as the driver has no machine left running.
    pub fn deactivate(&mut self) -> Result<()> {
        if self.host.deactivating {
            return Ok(());
        }
        debug!(state = ?self.host.state, "Deactivating");
        self.host.deactivating = true;
        self.host.state = AcquireState::Deactivating;

        if self.runner.is_idle() {
            if let Some(ssm) = self.driver.as_dyn().deactivate(&mut self.host) {
                self.start(ssm)?;
            }
        } else {
            let mut dispatch = Dispatch {
                driver: self.driver.as_dyn(),
                host: &mut self.host,
            };
            self.runner.cancel(&mut self.transport, &mut dispatch);
        }
        self.check_deactivated();
        Ok(())
    }

    /// Wait up to `timeout` for one transport event and process it.
    /// Returns whether an event was handled.
    pub fn handle_events(&mut self, timeout: Duration) -> Result<bool> {
        let Some(event) = self.transport.poll(timeout)? else {
            return Ok(false);
        };
        let mut dispatch = Dispatch {
            driver: self.driver.as_dyn(),
            host: &mut self.host,
        };
        self.runner
            .handle_event(event, &mut self.transport, &mut dispatch);
        self.check_deactivated();
        Ok(true)
    }

    /// Release the device. Deactivate first if capturing.
    pub fn close(mut self) -> Result<T> {
        if !self.runner.is_idle() {
            return Err(FpError::Resource("cannot close a busy device".into()));
        }
        self.driver.as_dyn().close(&mut self.host);
        let interface = self.host.info.interface;
        if let Err(e) = self.transport.release_interface(interface) {
            warn!(interface, error = %e, "Failed to release interface");
        }
        self.host.opened = false;
        self.host.emit(FpEvent::CloseComplete);
        Ok(self.transport)
    }

    fn start(&mut self, ssm: Ssm) -> Result<()> {
        let mut dispatch = Dispatch {
            driver: self.driver.as_dyn(),
            host: &mut self.host,
        };
        self.runner
            .start(ssm, &mut self.transport, &mut dispatch)?;
        self.check_deactivated();
        Ok(())
    }

    fn check_deactivated(&mut self) {
        if self.host.deactivating && self.runner.is_idle() {
            self.host.deactivating = false;
            self.host.state = AcquireState::Idle;
            self.host.emit(FpEvent::DeactivateComplete);
        }
    }
}
