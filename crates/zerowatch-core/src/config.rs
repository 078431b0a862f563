//! Application configuration and its sync with the shared store

use alloc::string::{String, ToString};

use embassy_time::Duration;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::store::{KeyValueStore, StoreError, config_key};

/// Runtime configuration consumed by the display and telemetry loops.
///
/// Field names on the wire are camelCase and match the store keys
/// `<id>:config:<name>`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Display brightness, 0-7
    pub brightness: i32,
    /// Seconds between display refreshes
    #[serde(rename = "refresh")]
    pub refresh_interval_secs: i32,
    pub debug: bool,
    /// Mirror log lines to `<id>:info:publishLogs`
    pub publish_logs: bool,
    pub pause_refresh: bool,
    /// Local only; never read from or written to the store
    pub deep_sleep_mode: bool,
}

impl AppConfig {
    /// Every field zero/false: what an empty remote yields
    pub const ZERO: Self = Self {
        brightness: 0,
        refresh_interval_secs: 0,
        debug: false,
        publish_logs: false,
        pause_refresh: false,
        deep_sleep_mode: false,
    };

    /// Refresh interval, never shorter than one second
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1) as u64)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            brightness: 7,
            refresh_interval_secs: 10,
            ..Self::ZERO
        }
    }
}

/// The fields mirrored in the store, in sync order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigField {
    Brightness,
    Refresh,
    Debug,
    PublishLogs,
    PauseRefresh,
}

impl ConfigField {
    pub const ALL: [ConfigField; 5] = [
        Self::Brightness,
        Self::Refresh,
        Self::Debug,
        Self::PublishLogs,
        Self::PauseRefresh,
    ];

    /// Position in [`ALL`](Self::ALL)
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Key suffix after `:config:`
    pub const fn name(self) -> &'static str {
        match self {
            Self::Brightness => "brightness",
            Self::Refresh => "refresh",
            Self::Debug => "debug",
            Self::PublishLogs => "publishLogs",
            Self::PauseRefresh => "pauseRefresh",
        }
    }

    /// Integer form of the field; booleans are 0 or 1
    pub fn get(self, config: &AppConfig) -> i32 {
        match self {
            Self::Brightness => config.brightness,
            Self::Refresh => config.refresh_interval_secs,
            Self::Debug => config.debug as i32,
            Self::PublishLogs => config.publish_logs as i32,
            Self::PauseRefresh => config.pause_refresh as i32,
        }
    }

    /// Store an integer into the field; any nonzero value is `true`
    pub fn set(self, config: &mut AppConfig, raw: i32) {
        match self {
            Self::Brightness => config.brightness = raw,
            Self::Refresh => config.refresh_interval_secs = raw,
            Self::Debug => config.debug = raw != 0,
            Self::PublishLogs => config.publish_logs = raw != 0,
            Self::PauseRefresh => config.pause_refresh = raw != 0,
        }
    }
}

/// Parse a leading decimal integer the way the backend's tooling writes
/// them: optional whitespace and sign, then digits. Anything unparsable,
/// including a missing value, is zero.
pub fn parse_lenient(value: Option<&str>) -> i32 {
    let Some(value) = value else {
        return 0;
    };
    let s = value.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let mut acc: i32 = 0;
    for b in digits.bytes().take_while(u8::is_ascii_digit) {
        acc = acc.saturating_mul(10).saturating_add((b - b'0') as i32);
    }
    if negative { -acc } else { acc }
}

/// Keeps the last configuration read from the store and pushes local
/// changes back field by field.
///
/// A local value whose write failed stays pending: it overrides the remote
/// value in [`read_remote`](Self::read_remote) and is written again by the
/// next [`push`](Self::push) or [`retry_unwritten`](Self::retry_unwritten)
/// until the store accepts it.
pub struct ConfigSync {
    identity: String,
    last_read: AppConfig,
    unwritten: [Option<i32>; ConfigField::ALL.len()],
}

impl ConfigSync {
    /// Start with an empty snapshot: the first push writes every field that
    /// is not zero/false.
    pub fn new(identity: &str) -> Self {
        Self {
            identity: String::from(identity),
            last_read: AppConfig::ZERO,
            unwritten: [None; ConfigField::ALL.len()],
        }
    }

    /// Remote values as of the last read or successful write
    pub fn last_read(&self) -> &AppConfig {
        &self.last_read
    }

    /// Number of local values still waiting to be written
    pub fn unwritten(&self) -> usize {
        self.unwritten.iter().filter(|v| v.is_some()).count()
    }

    /// Fetch every mirrored field.
    ///
    /// Missing or unparsable fields come back as zero/false; this is not an
    /// error. `deep_sleep_mode` is carried over from the previous snapshot.
    /// Fields with an unwritten local value report that value instead of the
    /// remote one; the snapshot keeps the remote one so the value is retried.
    pub async fn read_remote<S: KeyValueStore>(
        &mut self,
        store: &mut S,
    ) -> Result<AppConfig, StoreError> {
        let mut config = AppConfig {
            deep_sleep_mode: self.last_read.deep_sleep_mode,
            ..AppConfig::ZERO
        };

        for field in ConfigField::ALL {
            let raw = store.get(&config_key(&self.identity, field.name())).await?;
            if raw.is_none() {
                debug!("config: {} not set remotely, using 0", field.name());
            }
            field.set(&mut config, parse_lenient(raw.as_deref()));
        }

        self.last_read = config;
        Ok(self.with_unwritten(config))
    }

    /// Write every pending local value again; returns how many still fail.
    pub async fn retry_unwritten<S: KeyValueStore>(&mut self, store: &mut S) -> usize {
        if self.unwritten() == 0 {
            return 0;
        }
        let desired = self.with_unwritten(self.last_read);
        debug!("config: retrying {} unwritten fields", self.unwritten());
        self.push(store, &desired).await
    }

    fn with_unwritten(&self, mut config: AppConfig) -> AppConfig {
        for field in ConfigField::ALL {
            if let Some(value) = self.unwritten[field.index()] {
                field.set(&mut config, value);
            }
        }
        config
    }

    /// Write every mirrored field where `desired` differs from `previous`.
    ///
    /// Returns how many writes failed. Fields are independent: a failed
    /// write does not stop the others.
    pub async fn diff_and_push<S: KeyValueStore>(
        &self,
        store: &mut S,
        previous: &AppConfig,
        desired: &AppConfig,
    ) -> usize {
        let mut failures = 0;
        for field in ConfigField::ALL {
            if self.push_field(store, field, previous, desired).await.is_err() {
                failures += 1;
            }
        }
        failures
    }

    /// [`diff_and_push`](Self::diff_and_push) against the last read
    /// snapshot, recording each field that was written successfully and
    /// keeping each failed one pending.
    pub async fn push<S: KeyValueStore>(&mut self, store: &mut S, desired: &AppConfig) -> usize {
        let previous = self.last_read;
        let mut failures = 0;
        for field in ConfigField::ALL {
            let value = field.get(desired);
            match self.push_field(store, field, &previous, desired).await {
                Ok(()) => {
                    field.set(&mut self.last_read, value);
                    self.unwritten[field.index()] = None;
                }
                Err(_) => {
                    self.unwritten[field.index()] = Some(value);
                    failures += 1;
                }
            }
        }
        self.last_read.deep_sleep_mode = desired.deep_sleep_mode;
        failures
    }

    async fn push_field<S: KeyValueStore>(
        &self,
        store: &mut S,
        field: ConfigField,
        previous: &AppConfig,
        desired: &AppConfig,
    ) -> Result<(), StoreError> {
        let value = field.get(desired);
        if field.get(previous) == value {
            return Ok(());
        }

        let key = config_key(&self.identity, field.name());
        store.set(&key, &value.to_string()).await.inspect_err(|e| {
            warn!("config: write of {} failed: {}", key, e);
        })
    }
}
