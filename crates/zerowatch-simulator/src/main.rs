//! Desktop simulator for the zerowatch device control plane.
//!
//! Provisions a RAM-backed region, boots from it and runs the device's
//! polling cycle against an in-memory store. A scripted backend drops
//! commands into the store at fixed uptimes so the whole command/response
//! protocol, OTP gating included, can be watched without hardware.
//!
//! Uptime is simulated: each cycle advances the clock by the configured
//! refresh interval, so a run covering several OTP windows finishes at once.
//!
//! # Usage
//!
//! ```text
//! RUST_LOG=info zerowatch-simulator [record.json]
//! ```
//!
//! `record.json` is a provisioning record in its camelCase JSON form. Without
//! it a built-in demo record is used.

use std::fs;
use std::process::ExitCode;

use embassy_futures::block_on;
use embassy_time::{Duration, Instant};
use log::{error, info, warn};

use zerowatch_core::app_state::{AppState, DeviceContext};
use zerowatch_core::command::{FirmwareUpdater, UpdateRequest};
use zerowatch_core::otp::OtpGate;
use zerowatch_core::provisioning::{ProvisioningRecord, ProvisioningStore, REGION_SIZE, RamRegion};
use zerowatch_core::store::MemoryStore;

// ---------------------------------------------------------------------------
// Scenario constants
// ---------------------------------------------------------------------------

/// Cycles to run before printing the final store contents.
const CYCLES: usize = 48;

/// Uptime at which the backend asks for new display settings.
const APPLY_AT: Duration = Duration::from_secs(30);

/// Uptime of the first update attempt, before any OTP exists.
const EARLY_UPDATE_AT: Duration = Duration::from_secs(60);

/// Uptime of the update attempt with a wrong code.
const BAD_OTP_AT: Duration = Duration::from_secs(330);

/// Uptime at which the operator supplies the right code.
const GOOD_OTP_AT: Duration = Duration::from_secs(400);

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Accepts every image without fetching it.
struct SimUpdater;

impl FirmwareUpdater for SimUpdater {
    type Error = &'static str;

    async fn apply(&mut self, image_url: &str, request: &UpdateRequest) -> Result<(), Self::Error> {
        info!(
            "ota: staging {} ({} bytes, md5 {})",
            image_url, request.size, request.md5
        );
        Ok(())
    }
}

fn demo_record() -> ProvisioningRecord {
    ProvisioningRecord {
        identity: "ezero".into(),
        wifi_ssid: "attic".into(),
        wifi_password: "hunter22".into(),
        backend_host: "127.0.0.1".into(),
        backend_port: 6379,
        backend_password: String::new(),
        update_host: "updates.local".into(),
    }
}

fn load_record(path: Option<String>) -> Result<ProvisioningRecord, String> {
    let Some(path) = path else {
        return Ok(demo_record());
    };
    let raw = fs::read_to_string(&path).map_err(|e| format!("{path}: {e}"))?;
    serde_json::from_str(&raw).map_err(|e| format!("{path}: {e}"))
}

// ---------------------------------------------------------------------------
// Scripted backend
// ---------------------------------------------------------------------------

/// Drops the command scheduled for `uptime`, if any, into the store.
struct Backend {
    identity: String,
    otp: OtpGate,
    sent: [bool; 4],
}

impl Backend {
    fn new(identity: &str, otp: OtpGate) -> Self {
        Self {
            identity: identity.to_string(),
            otp,
            sent: [false; 4],
        }
    }

    fn update_payload(&self, otp: u16) -> String {
        format!(
            "{{\"url\":\"zero_watch_updates/zerowatch-0.2.1.bin\",\"md5\":\"eb8a0182161c88328c4888cc64e8a822\",\"size\":924368,\"otp\":{otp}}}"
        )
    }

    fn step(&mut self, store: &mut MemoryStore, uptime: Instant) {
        let elapsed = Duration::from_micros(uptime.as_micros());
        let apply_key = format!("{}:config:apply", self.identity);
        let update_key = format!("{}:config:update", self.identity);

        if !self.sent[0] && elapsed >= APPLY_AT {
            self.sent[0] = true;
            info!("backend: requesting brightness 3 with log publishing");
            store.insert(&apply_key, "{\"brightness\":3,\"publishLogs\":true}");
        }

        if !self.sent[1] && elapsed >= EARLY_UPDATE_AT {
            self.sent[1] = true;
            info!("backend: requesting update before the first OTP window");
            store.insert(&update_key, &self.update_payload(0));
        }

        if !self.sent[2] && elapsed >= BAD_OTP_AT {
            self.sent[2] = true;
            let wrong = match self.otp.compute(uptime, &self.identity) {
                Ok(code) => code.wrapping_add(1),
                Err(_) => 0,
            };
            info!("backend: retrying update with wrong code {wrong}");
            store.insert(&update_key, &self.update_payload(wrong));
        }

        if !self.sent[3] && elapsed >= GOOD_OTP_AT {
            self.sent[3] = true;
            match self.otp.compute(uptime, &self.identity) {
                Ok(code) => {
                    info!("backend: retrying update with code {code}");
                    store.insert(&update_key, &self.update_payload(code));
                }
                Err(e) => warn!("backend: {e}"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn run(record: ProvisioningRecord) -> Result<(), String> {
    let mut provisioning =
        ProvisioningStore::new(RamRegion::new(REGION_SIZE)).map_err(|e| e.to_string())?;
    provisioning.write(&record).map_err(|e| e.to_string())?;
    info!("provisioned {:?}", record);

    let record = provisioning.boot().map_err(|e| e.to_string())?;
    let otp = OtpGate::default();
    let device = DeviceContext::new(record, otp).map_err(|e| e.to_string())?;
    let mut backend = Backend::new(device.identity(), otp);

    let mut store = MemoryStore::new();
    let mut app = AppState::new(device, SimUpdater);
    block_on(app.start(&mut store)).map_err(|e| e.to_string())?;

    let mut uptime = Instant::from_secs(0);
    for _ in 0..CYCLES {
        backend.step(&mut store, uptime);

        let report = block_on(app.cycle(&mut store, uptime)).map_err(|e| e.to_string())?;
        info!(
            "t={:>4}s consumed={} retained={} brightness={} refresh={}s",
            uptime.as_secs(),
            report.commands.consumed,
            report.commands.retained,
            report.config.brightness,
            report.config.refresh_interval_secs,
        );

        if report.restart {
            info!("update staged, device would restart now");
            break;
        }

        let step = report.config.refresh_interval();
        store.advance(step);
        uptime += step;
    }

    info!("final store contents:");
    for key in store.keys() {
        info!("  {} = {:?}", key, store.value(key).unwrap_or_default());
    }
    for (channel, message) in store.published() {
        info!("  published {channel}: {message}");
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting zerowatch simulator");

    let record = match load_record(std::env::args().nth(1)) {
        Ok(record) => record,
        Err(e) => {
            error!("cannot load record: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(record) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
