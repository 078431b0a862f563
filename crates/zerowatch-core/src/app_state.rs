//! Application-wide state and error types for zerowatch
//!
//! [`DeviceContext`] is built once from the validated provisioning record and
//! passed by reference to command handlers, config sync and telemetry.
//! [`AppState`] owns those components and runs one polling cycle at a time.
//! [`AppError`] collects the failures they report so the caller can decide,
//! per [`Severity`], whether to halt or reconnect.

use alloc::format;
use alloc::string::String;

use embassy_time::Instant;
use heapless::String as HString;
use log::{info, warn};
use thiserror_no_std::Error;

use crate::command::{
    CONFIG_APPLY_SUFFIX, Command, CommandTable, ConfigApplyHandler, FIRMWARE_UPDATE_SUFFIX,
    FirmwareUpdateHandler, FirmwareUpdater, PollSummary,
};
use crate::config::{AppConfig, ConfigField, ConfigSync};
use crate::otp::{OtpError, OtpGate};
use crate::provisioning::{
    IDENTITY_SLOT_SIZE, ProvisioningError, ProvisioningRecord, ValidationError,
};
use crate::store::{KeyValueStore, StoreError, device_key};
use crate::telemetry::{self, HEARTBEAT_EXPIRY};

/// Device identity as stored in the identity slot
pub type Identity = HString<IDENTITY_SLOT_SIZE>;

/// How to react to an [`AppError`] or a failed command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Log and stop; a power cycle or re-provisioning is required
    Fatal,
    /// Drop this cycle's work and try again next cycle
    Retryable,
    /// The action is refused until the device has been up longer
    PendingUptime,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    #[error("provisioning: {0}")]
    Provisioning(#[from] ProvisioningError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("network: {0}")]
    Network(String),
}

impl AppError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::Provisioning(_) => Severity::Fatal,
            Self::Store(_) | Self::Network(_) => Severity::Retryable,
        }
    }
}

/// Identity, credentials and authorization gate of a provisioned device
#[derive(Debug, Clone)]
pub struct DeviceContext {
    identity: Identity,
    record: ProvisioningRecord,
    otp: OtpGate,
}

impl DeviceContext {
    /// Wrap a record returned by
    /// [`ProvisioningStore::boot`](crate::provisioning::ProvisioningStore::boot).
    pub fn new(record: ProvisioningRecord, otp: OtpGate) -> Result<Self, ProvisioningError> {
        record.check().map_err(ProvisioningError::NotProvisioned)?;

        let mut identity = Identity::new();
        identity.push_str(&record.identity).map_err(|_| {
            ProvisioningError::NotProvisioned(ValidationError::IdentityTooLong {
                len: record.identity.len(),
            })
        })?;

        Ok(Self {
            identity,
            record,
            otp,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn credentials(&self) -> &ProvisioningRecord {
        &self.record
    }

    pub fn otp(&self) -> &OtpGate {
        &self.otp
    }

    /// `identity + suffix`
    pub fn key(&self, suffix: &str) -> String {
        device_key(&self.identity, suffix)
    }

    /// Check a candidate code at `uptime` against this device's identity.
    pub fn check_otp(&self, uptime: Instant, candidate: u16) -> Result<bool, OtpError> {
        self.otp.check(uptime, &self.identity, candidate)
    }
}

/// What one [`AppState::cycle`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub commands: PollSummary,
    /// Configuration in effect after the cycle
    pub config: AppConfig,
    /// Config fields that could not be written back
    pub config_write_failures: usize,
    /// A firmware image was staged; set even if deleting the request failed
    pub restart: bool,
}

/// Main application state container
///
/// Owns the device context, config sync and the command table. The caller
/// supplies the store connection and the current uptime on every call.
pub struct AppState<U> {
    device: DeviceContext,
    sync: ConfigSync,
    commands: CommandTable<Command<U>>,
    config: AppConfig,
    bootcount: Option<i64>,
}

impl<U: FirmwareUpdater> AppState<U> {
    pub fn new(device: DeviceContext, updater: U) -> Self {
        let config = AppConfig::default();
        let mut commands = CommandTable::new();
        for command in [
            Command::ConfigApply(ConfigApplyHandler::new(config)),
            Command::FirmwareUpdate(FirmwareUpdateHandler::new(updater)),
        ] {
            commands.register(command.suffix(), command);
        }

        Self {
            sync: ConfigSync::new(device.identity()),
            device,
            commands,
            config,
            bootcount: None,
        }
    }

    pub fn device(&self) -> &DeviceContext {
        &self.device
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Boot count recorded on the first successful [`start`](Self::start)
    pub fn bootcount(&self) -> Option<i64> {
        self.bootcount
    }

    /// Run once per store connection.
    ///
    /// Counts the boot on the first connection only, then adopts the remote
    /// configuration. A backend with nothing configured is seeded with the
    /// boot defaults instead.
    pub async fn start<S: KeyValueStore>(&mut self, store: &mut S) -> Result<(), AppError> {
        if self.bootcount.is_none() {
            let count =
                telemetry::increment_bootcount(store, self.device.identity(), false).await?;
            info!("app: boot #{}", count);
            self.bootcount = Some(count);
        }

        let remote = self.sync.read_remote(store).await?;
        if ConfigField::ALL.iter().all(|field| field.get(&remote) == 0) {
            info!("app: no remote configuration, seeding defaults");
            let failures = self.sync.push(store, &self.config).await;
            if failures > 0 {
                warn!("app: {} default fields not written", failures);
            }
        } else {
            self.adopt(remote);
        }
        Ok(())
    }

    /// One polling cycle: heartbeat, config refresh, commands, write-back.
    ///
    /// Store failures abort the cycle and are returned; command failures are
    /// not errors and only show up in the report.
    pub async fn cycle<S: KeyValueStore>(
        &mut self,
        store: &mut S,
        uptime: Instant,
    ) -> Result<CycleReport, AppError> {
        telemetry::heartbeat(store, self.device.identity(), uptime, HEARTBEAT_EXPIRY).await?;

        let remote = self.sync.read_remote(store).await?;
        self.adopt(remote);

        let commands = self.commands.poll_all(&self.device, store, uptime).await;

        let mut config_write_failures = 0;
        if let Some(pending) = self.take_pending_config() {
            config_write_failures = self.sync.push(store, &pending).await;
            self.adopt(pending);
        } else if self.sync.unwritten() > 0 {
            config_write_failures = self.sync.retry_unwritten(store).await;
        }
        if config_write_failures > 0 {
            warn!("app: {} config fields not written", config_write_failures);
        }

        if self.config.publish_logs && commands.consumed + commands.retained > 0 {
            let line = format!(
                "{}: {} commands consumed, {} retained",
                self.device.identity(),
                commands.consumed,
                commands.retained
            );
            if let Err(e) = telemetry::publish_log(store, self.device.identity(), &line).await {
                warn!("app: log publish failed: {}", e);
            }
        }

        Ok(CycleReport {
            commands,
            config: self.config,
            config_write_failures,
            restart: self.restart_pending(),
        })
    }

    fn adopt(&mut self, config: AppConfig) {
        self.config = config;
        if let Some(Command::ConfigApply(handler)) = self.commands.get_mut(CONFIG_APPLY_SUFFIX) {
            handler.set_current(config);
        }
    }

    fn take_pending_config(&mut self) -> Option<AppConfig> {
        match self.commands.get_mut(CONFIG_APPLY_SUFFIX) {
            Some(Command::ConfigApply(handler)) => handler.take_pending(),
            _ => None,
        }
    }

    fn restart_pending(&mut self) -> bool {
        matches!(
            self.commands.get_mut(FIRMWARE_UPDATE_SUFFIX),
            Some(Command::FirmwareUpdate(handler)) if handler.restart_pending()
        )
    }
}
