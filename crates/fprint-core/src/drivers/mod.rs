//! Per-family image drivers.
//!
//! - `aeslib`: AuthenTec register writer shared by the AES families
//! - `vfslib`: Validity script exchange shared by the VFS families
//! - one module per supported sensor family
//!
//! [`DriverKind`] is the registry: it maps USB IDs to a family and builds
//! the family's [`Driver`] from the [`DriverConfig`].

pub mod aes1610;
pub mod aes2501;
pub mod aes2550;
pub mod aes3k;
pub mod aeslib;
pub mod aesx660;
pub mod elan;
pub mod etes603;
pub mod fdu2000;
pub mod upeksonly;
pub mod upektc;
pub mod upektc_img;
pub mod uru4000;
pub mod vcom5s;
pub mod vfs0050;
pub mod vfs0090;
pub mod vfs101;
pub mod vfs301;
pub mod vfs5011;
pub mod vfslib;

use tracing::debug;

use crate::config::DriverConfig;
use crate::error::FpError;
use crate::imgdev::{DriverInfo, ImageDriver};

use aes1610::Aes1610;
use aes2501::Aes2501;
use aes2550::Aes2550;
use aes3k::Aes3k;
use aesx660::AesX660;
use elan::Elan;
use etes603::Etes603;
use fdu2000::Fdu2000;
use upeksonly::UpekSonly;
use upektc::UpekTc;
use upektc_img::UpekTcImg;
use uru4000::Uru4000;
use vcom5s::Vcom5s;
use vfs0050::Vfs0050;
use vfs0090::Vfs0090;
use vfs101::Vfs101;
use vfs301::Vfs301;
use vfs5011::Vfs5011;

/// Supported driver families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Aes1610,
    Aes1660,
    Aes2501,
    Aes2550,
    Aes2660,
    Aes3500,
    Elan,
    Etes603,
    Fdu2000,
    UpekSonly,
    UpekTc,
    UpekTcImg,
    Uru4000,
    Vcom5s,
    Vfs101,
    Vfs301,
    Vfs5011,
    Vfs0050,
    Vfs0090,
}

impl DriverKind {
    pub const ALL: [DriverKind; 19] = [
        DriverKind::Aes1610,
        DriverKind::Aes1660,
        DriverKind::Aes2501,
        DriverKind::Aes2550,
        DriverKind::Aes2660,
        DriverKind::Aes3500,
        DriverKind::Elan,
        DriverKind::Etes603,
        DriverKind::Fdu2000,
        DriverKind::UpekSonly,
        DriverKind::UpekTc,
        DriverKind::UpekTcImg,
        DriverKind::Uru4000,
        DriverKind::Vcom5s,
        DriverKind::Vfs101,
        DriverKind::Vfs301,
        DriverKind::Vfs5011,
        DriverKind::Vfs0050,
        DriverKind::Vfs0090,
    ];

    pub fn info(self) -> &'static DriverInfo {
        match self {
            DriverKind::Aes1610 => &aes1610::INFO,
            DriverKind::Aes1660 => &aesx660::AES1660_INFO,
            DriverKind::Aes2501 => &aes2501::INFO,
            DriverKind::Aes2550 => &aes2550::INFO,
            DriverKind::Aes2660 => &aesx660::AES2660_INFO,
            DriverKind::Aes3500 => &aes3k::AES3500_INFO,
            DriverKind::Elan => &elan::INFO,
            DriverKind::Etes603 => &etes603::INFO,
            DriverKind::Fdu2000 => &fdu2000::INFO,
            DriverKind::UpekSonly => &upeksonly::INFO,
            DriverKind::UpekTc => &upektc::INFO,
            DriverKind::UpekTcImg => &upektc_img::INFO,
            DriverKind::Uru4000 => &uru4000::INFO,
            DriverKind::Vcom5s => &vcom5s::INFO,
            DriverKind::Vfs101 => &vfs101::INFO,
            DriverKind::Vfs301 => &vfs301::INFO,
            DriverKind::Vfs5011 => &vfs5011::INFO,
            DriverKind::Vfs0050 => &vfs0050::INFO,
            DriverKind::Vfs0090 => &vfs0090::INFO,
        }
    }

    /// Family handling the given USB IDs.
    pub fn from_ids(vid: u16, pid: u16) -> Option<Self> {
        let kind = Self::ALL
            .into_iter()
            .find(|kind| kind.info().matches(vid, pid));
        debug!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            ?kind,
            "Driver lookup"
        );
        kind
    }

    /// Build the family's device context.
    pub fn create(self, config: &DriverConfig, vid: u16, pid: u16) -> Result<Driver, FpError> {
        Ok(match self {
            DriverKind::Aes1610 => Driver::Aes1610(Aes1610::new(config.aes1610.clone())),
            DriverKind::Aes1660 => Driver::AesX660(AesX660::aes1660(&config.aes1660)?),
            DriverKind::Aes2501 => Driver::Aes2501(Aes2501::new()),
            DriverKind::Aes2550 => Driver::Aes2550(Aes2550::new()),
            DriverKind::Aes2660 => Driver::AesX660(AesX660::aes2660(&config.aes2660)?),
            DriverKind::Aes3500 => Driver::Aes3k(Aes3k::aes3500()),
            DriverKind::Elan => Driver::Elan(Elan::new(config.elan.clone())),
            DriverKind::Etes603 => Driver::Etes603(Etes603::new()),
            DriverKind::Fdu2000 => Driver::Fdu2000(Fdu2000::new()),
            DriverKind::UpekSonly => Driver::UpekSonly(UpekSonly::new(&config.upeksonly, pid)?),
            DriverKind::UpekTc => Driver::UpekTc(UpekTc::new(&config.upektc, pid)?),
            DriverKind::UpekTcImg => Driver::UpekTcImg(UpekTcImg::new(&config.upektc_img)?),
            DriverKind::Uru4000 => Driver::Uru4000(Uru4000::new(vid, pid)?),
            DriverKind::Vcom5s => Driver::Vcom5s(Vcom5s::new()),
            DriverKind::Vfs101 => Driver::Vfs101(Vfs101::new()),
            DriverKind::Vfs301 => Driver::Vfs301(Vfs301::new(&config.vfs301)?),
            DriverKind::Vfs5011 => Driver::Vfs5011(Vfs5011::new(&config.vfs5011)?),
            DriverKind::Vfs0050 => Driver::Vfs0050(Vfs0050::new(&config.vfs0050)?),
            DriverKind::Vfs0090 => Driver::Vfs0090(Box::new(Vfs0090::new(&config.vfs0090)?)),
        })
    }
}

/// One family's device context.
pub enum Driver {
    Aes1610(Aes1610),
    Aes2501(Aes2501),
    Aes2550(Aes2550),
    AesX660(AesX660),
    Aes3k(Aes3k),
    Elan(Elan),
    Etes603(Etes603),
    Fdu2000(Fdu2000),
    UpekSonly(UpekSonly),
    UpekTc(UpekTc),
    UpekTcImg(UpekTcImg),
    Uru4000(Uru4000),
    Vcom5s(Vcom5s),
    Vfs101(Vfs101),
    Vfs301(Vfs301),
    Vfs5011(Vfs5011),
    Vfs0050(Vfs0050),
    Vfs0090(Box<Vfs0090>),
}

impl Driver {
    pub fn as_dyn(&mut self) -> &mut dyn ImageDriver {
        match self {
            Driver::Aes1610(d) => d,
            Driver::Aes2501(d) => d,
            Driver::Aes2550(d) => d,
            Driver::AesX660(d) => d,
            Driver::Aes3k(d) => d,
            Driver::Elan(d) => d,
            Driver::Etes603(d) => d,
            Driver::Fdu2000(d) => d,
            Driver::UpekSonly(d) => d,
            Driver::UpekTc(d) => d,
            Driver::UpekTcImg(d) => d,
            Driver::Uru4000(d) => d,
            Driver::Vcom5s(d) => d,
            Driver::Vfs101(d) => d,
            Driver::Vfs301(d) => d,
            Driver::Vfs5011(d) => d,
            Driver::Vfs0050(d) => d,
            Driver::Vfs0090(d) => d.as_mut(),
        }
    }
}
