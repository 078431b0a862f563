//! Operator-only builds that rewrite or wipe the provisioning file
//!
//! Both paths wait [`OPERATOR_ABORT_DELAY`] first so a device flashed with
//! the wrong image can be powered off before anything is touched.

use embassy_time::{Duration, Timer};
use log::warn;

#[cfg(feature = "provisioning-mode")]
use alloc::string::String;
#[cfg(feature = "provisioning-mode")]
use zerowatch_core::provisioning::ProvisioningRecord;

pub const OPERATOR_ABORT_DELAY: Duration = Duration::from_secs(60);

const COUNTDOWN_STEP: Duration = Duration::from_secs(10);

/// Count down to a destructive action, logging as we go
pub async fn operator_abort_window(action: &str) {
    let mut remaining = OPERATOR_ABORT_DELAY;
    while remaining > Duration::from_ticks(0) {
        warn!("{} in {} s, power off now to abort", action, remaining.as_secs());
        let step = if remaining < COUNTDOWN_STEP {
            remaining
        } else {
            COUNTDOWN_STEP
        };
        Timer::after(step).await;
        remaining -= step;
    }
}

/// The record baked in from `.env` at build time.
///
/// A port that does not parse becomes zero, which validation rejects.
#[cfg(feature = "provisioning-mode")]
pub fn operator_record() -> ProvisioningRecord {
    ProvisioningRecord {
        identity: String::from(env!("ZW_PROV_IDENTITY")),
        wifi_ssid: String::from(env!("ZW_PROV_WIFI_SSID")),
        wifi_password: String::from(env!("ZW_PROV_WIFI_PASSWORD")),
        backend_host: String::from(env!("ZW_PROV_BACKEND_HOST")),
        backend_port: env!("ZW_PROV_BACKEND_PORT").parse().unwrap_or(0),
        backend_password: String::from(env!("ZW_PROV_BACKEND_PASSWORD")),
        update_host: String::from(env!("ZW_PROV_UPDATE_HOST")),
    }
}
