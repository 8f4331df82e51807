//! AuthenTec AES3500 press sensor and its AES3K relatives.
//!
//! After one register script the sensor answers a single bulk read with
//! the whole finger: a run of 16-row frames, each led by a header byte and
//! packed as 4-bit pixels column by column. The image is too small for
//! minutiae extraction, so it is upscaled before delivery.

use tracing::{debug, trace};

use super::aeslib::{EP_IN, RegWrite, RegWriter};
use crate::error::FpError;
use crate::image::{Image, ImageFlags};
use crate::imgdev::{DriverInfo, Host, ImageDriver};
use crate::ssm::{Phase, Ssm, Step, ssm_states};
use crate::transport::{Completion, Transfer};

pub const FRAME_HEIGHT: usize = 16;

/// Geometry of one AES3K part.
#[derive(Debug)]
pub struct Aes3kModel {
    /// Square frame edge before upscaling.
    pub frame_width: usize,
    pub enlarge_factor: usize,
    pub data_buflen: usize,
    pub init_reqs: &'static [RegWrite],
}

impl Aes3kModel {
    pub const fn frame_size(&self) -> usize {
        self.frame_width * FRAME_HEIGHT / 2
    }

    pub const fn frame_number(&self) -> usize {
        self.frame_width / FRAME_HEIGHT
    }
}

const AES3500_FRAME_WIDTH: usize = 128;
const AES3500_ENLARGE: usize = 2;

const AES3500_INIT: &[RegWrite] = &[
    // master reset
    RegWrite::new(0x80, 0x01),
    RegWrite::SPLIT,
    RegWrite::new(0x80, 0x00),
    RegWrite::SPLIT,
    RegWrite::new(0x81, 0x00),
    RegWrite::new(0x80, 0x00),
    RegWrite::SPLIT,
    // scan reset
    RegWrite::new(0x80, 0x02),
    RegWrite::SPLIT,
    RegWrite::new(0x80, 0x00),
    RegWrite::SPLIT,
    // register buffering off
    RegWrite::new(0x80, 0x04),
    RegWrite::SPLIT,
    RegWrite::new(0x80, 0x00),
    RegWrite::SPLIT,
    RegWrite::new(0x81, 0x00),
    RegWrite::SPLIT,
    RegWrite::new(0x80, 0x00),
    RegWrite::new(0x81, 0x00),
    RegWrite::new(0x82, 0x04), // excitation bias
    RegWrite::new(0x83, 0x13), // continuous finger detection
    RegWrite::new(0x84, 0x07),
    RegWrite::new(0x85, 0x3d),
    RegWrite::new(0x86, 0x03),
    RegWrite::new(0x87, 0x01),
    RegWrite::new(0x88, 0x02),
    RegWrite::new(0x89, 0x02),
    RegWrite::new(0x8a, 0x33),
    RegWrite::new(0x8b, 0x33),
    RegWrite::new(0x8c, 0x0f),
    RegWrite::new(0x8d, 0x04),
    RegWrite::new(0x8e, 0x23), // sensor gain
    RegWrite::new(0x8f, 0x07),
    RegWrite::new(0x90, 0x00),
    RegWrite::new(0x91, 0x1c),
    RegWrite::new(0x92, 0x08),
    RegWrite::new(0x93, 0x00),
    RegWrite::new(0x94, 0x07),
    RegWrite::new(0x95, 0x00),
    RegWrite::new(0x96, 0x1f),
    RegWrite::new(0x97, 0x04),
    RegWrite::new(0x98, 0x28),
    RegWrite::new(0x99, 0x00),
    RegWrite::new(0x9a, 0x0b),
    RegWrite::new(0x9b, 0x00),
    RegWrite::new(0x9c, 0x00),
    RegWrite::new(0x9d, 0x09),
    RegWrite::new(0x9e, 0x53),
    RegWrite::new(0x9f, 0x6b),
    RegWrite::SPLIT,
    RegWrite::new(0x80, 0x00),
    RegWrite::new(0x81, 0x00),
    RegWrite::SPLIT,
    RegWrite::new(0x81, 0x04),
    RegWrite::SPLIT,
    RegWrite::new(0x81, 0x00),
];

pub static AES3500: Aes3kModel = Aes3kModel {
    frame_width: AES3500_FRAME_WIDTH,
    enlarge_factor: AES3500_ENLARGE,
    data_buflen: 0x2089,
    init_reqs: AES3500_INIT,
};

pub static AES3500_INFO: DriverInfo = DriverInfo {
    name: "aes3500",
    full_name: "AuthenTec AES3500",
    id_table: &[(0x08ff, 0x5731)],
    img_width: Some(AES3500_FRAME_WIDTH * AES3500_ENLARGE),
    img_height: Some(AES3500_FRAME_WIDTH * AES3500_ENLARGE),
    bz3_threshold: Some(9),
    interface: 0,
};

ssm_states! {
    enum ActivateState {
        WriteInit,
    }
}

ssm_states! {
    enum CaptureState {
        ReadImage,
    }
}

/// Unpack the frames of one read into a square image.
pub fn decode_frames(model: &Aes3kModel, data: &[u8]) -> Image {
    let width = model.frame_width;
    let mut img = Image::new(width, width);
    let mut frames = data.chunks_exact(model.frame_size() + 1);
    for (i, frame) in frames.by_ref().take(model.frame_number()).enumerate() {
        trace!(header = frame[0], "Frame header");
        let out = &mut img.data[i * width * FRAME_HEIGHT..(i + 1) * width * FRAME_HEIGHT];
        let mut packed = frame[1..].iter();
        for column in 0..width {
            for row in (0..FRAME_HEIGHT).step_by(2) {
                let byte = packed.next().copied().unwrap_or_default();
                out[width * row + column] = (byte & 0x0f) * 17;
                out[width * (row + 1) + column] = (byte >> 4) * 17;
            }
        }
    }
    img.with_flags(ImageFlags::COLORS_INVERTED | ImageFlags::V_FLIPPED | ImageFlags::H_FLIPPED)
}

pub struct Aes3k {
    model: &'static Aes3kModel,
    info: &'static DriverInfo,
    regs: RegWriter,
}

impl Aes3k {
    pub fn aes3500() -> Self {
        Self {
            model: &AES3500,
            info: &AES3500_INFO,
            regs: RegWriter::new(),
        }
    }

    fn image_done(&self, completion: &Completion, host: &mut Host) -> Step {
        let data = match completion.check_full() {
            Ok(data) => data,
            Err(e) => return Step::Abort(e),
        };
        host.report_finger_status(true);
        let img = decode_frames(self.model, data);
        debug!(factor = self.model.enlarge_factor, "Upscaling press image");
        host.image_captured(img.resize(self.model.enlarge_factor, self.model.enlarge_factor));
        // The sensor has no finger-off report
        host.report_finger_status(false);
        Step::Complete
    }
}

impl ImageDriver for Aes3k {
    fn info(&self) -> &'static DriverInfo {
        self.info
    }

    fn activate(&mut self, _host: &mut Host) -> Result<Ssm, FpError> {
        Ok(Ssm::for_states::<ActivateState>(Phase::Activate))
    }

    fn run_state(&mut self, ssm: &Ssm, _host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::WriteRegs => self.regs.run_state(ssm),
            Phase::Activate => self.regs.write(self.model.init_reqs),
            Phase::Capture => {
                Step::Submit(Transfer::bulk_in(EP_IN, self.model.data_buflen, 0))
            }
            phase => Step::Abort(FpError::protocol(format!("unexpected machine {}", phase))),
        }
    }

    fn transfer_done(&mut self, ssm: &Ssm, completion: Completion, host: &mut Host) -> Step {
        match ssm.phase() {
            Phase::WriteRegs => self.regs.transfer_done(&completion),
            _ => self.image_done(&completion, host),
        }
    }

    fn machine_done(&mut self, ssm: Ssm, host: &mut Host) -> Option<Ssm> {
        let phase = ssm.phase();
        let result = ssm.into_result();
        if phase == Phase::Activate {
            let ok = result.is_ok();
            host.activate_complete(result);
            return ok.then(|| Ssm::for_states::<CaptureState>(Phase::Capture));
        }
        if host.is_deactivating() {
            return None;
        }
        match result {
            Ok(()) => Some(Ssm::for_states::<CaptureState>(Phase::Capture)),
            Err(e) => {
                host.session_error(e);
                None
            }
        }
    }
}
