//! ESP32-S3 firmware-specific modules for zerowatch
//!
//! This crate contains the code that cannot compile on desktop targets:
//! power and SD card bring-up, the SD-backed provisioning region, Wi-Fi
//! bootstrap and the TCP transport to the backend store.

#![no_std]

extern crate alloc;

pub mod hardware;
pub mod net;
#[cfg(any(feature = "provisioning-mode", feature = "delete-provisioning"))]
pub mod provisioning_mode;
pub mod sd_region;
pub mod socket;

use core::fmt::Display;

use log::error;
use zerowatch_core::command::{FirmwareUpdater, UpdateRequest};

/// Log `reason` and park the CPU. Only a power cycle gets out of here.
pub fn halt(reason: &dyn Display) -> ! {
    error!("HALT: {}", reason);
    loop {
        core::hint::spin_loop();
    }
}

/// Updater for builds without an OTA partition table.
///
/// Every update is refused, so the backend sees an error response and the
/// request stays queued.
pub struct NoOta;

impl FirmwareUpdater for NoOta {
    type Error = &'static str;

    async fn apply(&mut self, image_url: &str, _: &UpdateRequest) -> Result<(), Self::Error> {
        error!("ota: refusing {}", image_url);
        Err("this build has no OTA partitions")
    }
}
