//! Concrete command handlers

use alloc::format;
use alloc::string::String;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::{CommandHandler, CommandRequest, HandlerFailure, HandlerOutcome, Responder};
use crate::config::AppConfig;
use crate::store::KeyValueStore;

/// Request key suffix for configuration patches
pub const CONFIG_APPLY_SUFFIX: &str = ":config:apply";

/// Request key suffix for firmware updates
pub const FIRMWARE_UPDATE_SUFFIX: &str = ":config:update";

#[derive(Serialize)]
struct Reply<'a> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

fn reply(error: Option<&str>) -> String {
    serde_json::to_string(&Reply {
        ok: error.is_none(),
        error,
    })
    .unwrap_or_default()
}

fn describe(failure: HandlerFailure) -> &'static str {
    match failure {
        HandlerFailure::OtpMismatch => "otp mismatch",
        HandlerFailure::OtpUnavailable => "otp not yet available",
        HandlerFailure::BadPayload => "bad payload",
        HandlerFailure::Action => "action failed",
    }
}

/// Respond with the failure and hand it back as the outcome
async fn reject<S: KeyValueStore>(
    responder: &mut Responder<'_, S>,
    failure: HandlerFailure,
) -> HandlerOutcome {
    // a lost response is already logged by the responder
    let _ = responder.set_value(&reply(Some(describe(failure)))).await;
    HandlerOutcome::Failure(failure)
}

/// Check a request's code; a missing code is a mismatch
fn authorize(request: &CommandRequest<'_>, otp: Option<u16>) -> Result<(), HandlerFailure> {
    let Some(code) = otp else {
        return Err(HandlerFailure::OtpMismatch);
    };
    match request.device.check_otp(request.uptime, code) {
        Ok(true) => Ok(()),
        Ok(false) => Err(HandlerFailure::OtpMismatch),
        Err(e) => {
            warn!("command: {}", e);
            Err(HandlerFailure::OtpUnavailable)
        }
    }
}

/// Payload of a firmware update request
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    /// Absolute URL, or a path on the provisioned update host
    pub url: String,
    pub md5: String,
    /// Image size in bytes
    pub size: u32,
    pub otp: u16,
}

impl UpdateRequest {
    /// Absolute image URL, resolving a relative `url` against `update_host`
    pub fn image_url(&self, update_host: &str) -> String {
        if self.url.contains("://") {
            self.url.clone()
        } else {
            format!("http://{}/{}", update_host, self.url.trim_start_matches('/'))
        }
    }
}

/// The over-the-air updater; image transfer happens behind this trait.
#[allow(async_fn_in_trait)]
pub trait FirmwareUpdater {
    type Error: core::fmt::Display;

    /// Fetch and stage the image. On `Ok` the device must restart to boot it.
    async fn apply(&mut self, image_url: &str, request: &UpdateRequest)
    -> Result<(), Self::Error>;
}

/// Handles `<id>:config:update`; always OTP-gated
pub struct FirmwareUpdateHandler<U> {
    updater: U,
    restart_pending: bool,
}

impl<U: FirmwareUpdater> FirmwareUpdateHandler<U> {
    pub fn new(updater: U) -> Self {
        Self {
            updater,
            restart_pending: false,
        }
    }

    pub fn updater(&self) -> &U {
        &self.updater
    }

    /// An image was staged; restart once the request has been acknowledged.
    pub fn restart_pending(&self) -> bool {
        self.restart_pending
    }
}

impl<U: FirmwareUpdater> CommandHandler for FirmwareUpdateHandler<U> {
    async fn handle<S: KeyValueStore>(
        &mut self,
        request: &CommandRequest<'_>,
        responder: &mut Responder<'_, S>,
    ) -> HandlerOutcome {
        let update: UpdateRequest = match serde_json::from_str(request.payload) {
            Ok(update) => update,
            Err(e) => {
                warn!("update: bad payload: {}", e);
                return reject(responder, HandlerFailure::BadPayload).await;
            }
        };

        if let Err(failure) = authorize(request, Some(update.otp)) {
            return reject(responder, failure).await;
        }

        let url = update.image_url(&request.device.credentials().update_host);
        info!("update: {} ({} bytes, md5 {})", url, update.size, update.md5);

        match self.updater.apply(&url, &update).await {
            Ok(()) => {
                self.restart_pending = true;
                let _ = responder.set_value(&reply(None)).await;
                HandlerOutcome::Success
            }
            Err(e) => {
                warn!("update: {}", e);
                reject(responder, HandlerFailure::Action).await
            }
        }
    }
}

/// Partial configuration sent to `<id>:config:apply`
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
    pub brightness: Option<i32>,
    #[serde(rename = "refresh")]
    pub refresh_interval_secs: Option<i32>,
    pub debug: Option<bool>,
    pub publish_logs: Option<bool>,
    pub pause_refresh: Option<bool>,
    pub deep_sleep_mode: Option<bool>,
    pub otp: Option<u16>,
}

impl ConfigPatch {
    /// Whether applying the patch would flip deep sleep mode
    pub fn changes_deep_sleep(&self, current: &AppConfig) -> bool {
        self.deep_sleep_mode
            .is_some_and(|mode| mode != current.deep_sleep_mode)
    }

    pub fn apply_to(&self, config: &mut AppConfig) {
        if let Some(v) = self.brightness {
            config.brightness = v;
        }
        if let Some(v) = self.refresh_interval_secs {
            config.refresh_interval_secs = v;
        }
        if let Some(v) = self.debug {
            config.debug = v;
        }
        if let Some(v) = self.publish_logs {
            config.publish_logs = v;
        }
        if let Some(v) = self.pause_refresh {
            config.pause_refresh = v;
        }
        if let Some(v) = self.deep_sleep_mode {
            config.deep_sleep_mode = v;
        }
    }
}

/// Handles `<id>:config:apply`.
///
/// Accepted patches accumulate into a pending configuration that the main
/// loop collects with [`take_pending`](Self::take_pending).
pub struct ConfigApplyHandler {
    current: AppConfig,
    pending: Option<AppConfig>,
}

impl ConfigApplyHandler {
    pub fn new(current: AppConfig) -> Self {
        Self {
            current,
            pending: None,
        }
    }

    /// Track the configuration in effect so patches merge onto it
    pub fn set_current(&mut self, config: AppConfig) {
        self.current = config;
    }

    pub fn current(&self) -> &AppConfig {
        &self.current
    }

    pub fn take_pending(&mut self) -> Option<AppConfig> {
        self.pending.take()
    }
}

impl CommandHandler for ConfigApplyHandler {
    async fn handle<S: KeyValueStore>(
        &mut self,
        request: &CommandRequest<'_>,
        responder: &mut Responder<'_, S>,
    ) -> HandlerOutcome {
        let patch: ConfigPatch = match serde_json::from_str(request.payload) {
            Ok(patch) => patch,
            Err(e) => {
                warn!("config apply: bad payload: {}", e);
                return reject(responder, HandlerFailure::BadPayload).await;
            }
        };

        if patch.changes_deep_sleep(&self.current) {
            if let Err(failure) = authorize(request, patch.otp) {
                return reject(responder, failure).await;
            }
        }

        let mut config = self.current;
        patch.apply_to(&mut config);
        info!("config apply: {:?}", config);
        self.current = config;
        self.pending = Some(config);

        let _ = responder.set_value(&reply(None)).await;
        HandlerOutcome::Success
    }
}

/// Every command the firmware registers
pub enum Command<U> {
    ConfigApply(ConfigApplyHandler),
    FirmwareUpdate(FirmwareUpdateHandler<U>),
}

impl<U> Command<U> {
    pub const fn suffix(&self) -> &'static str {
        match self {
            Self::ConfigApply(_) => CONFIG_APPLY_SUFFIX,
            Self::FirmwareUpdate(_) => FIRMWARE_UPDATE_SUFFIX,
        }
    }
}

impl<U: FirmwareUpdater> CommandHandler for Command<U> {
    async fn handle<S: KeyValueStore>(
        &mut self,
        request: &CommandRequest<'_>,
        responder: &mut Responder<'_, S>,
    ) -> HandlerOutcome {
        match self {
            Self::ConfigApply(handler) => handler.handle(request, responder).await,
            Self::FirmwareUpdate(handler) => handler.handle(request, responder).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::DeviceContext;
    use crate::command::{CommandTable, PollOutcome, poll};
    use crate::otp::OtpGate;
    use crate::provisioning::ProvisioningRecord;
    use crate::store::MemoryStore;
    use alloc::vec::Vec;
    use embassy_futures::block_on;
    use embassy_time::Instant;

    /// Uptime at which "zero" has code 550
    const UPTIME: Instant = Instant::from_micros(18_000_000_001);
    const CODE: u16 = 550;

    #[derive(Default)]
    struct FakeUpdater {
        urls: Vec<String>,
        fail: bool,
    }

    impl FirmwareUpdater for FakeUpdater {
        type Error = &'static str;

        async fn apply(&mut self, image_url: &str, _: &UpdateRequest) -> Result<(), &'static str> {
            self.urls.push(String::from(image_url));
            if self.fail { Err("md5 mismatch") } else { Ok(()) }
        }
    }

    fn device() -> DeviceContext {
        let record = ProvisioningRecord {
            identity: String::from("zero"),
            wifi_ssid: String::from("attic"),
            wifi_password: String::from("hunter22"),
            backend_host: String::from("10.0.0.5"),
            backend_port: 6379,
            backend_password: String::new(),
            update_host: String::from("updates.local"),
        };
        DeviceContext::new(record, OtpGate::new(5)).unwrap()
    }

    fn update_payload(otp: u16) -> String {
        format!(
            "{{\"url\":\"zero_watch_updates/zw-0.2.1.bin\",\"md5\":\"eb8a\",\"size\":924368,\"otp\":{}}}",
            otp
        )
    }

    #[test]
    fn test_image_url() {
        let mut update = UpdateRequest {
            url: String::from("/images/a.bin"),
            md5: String::new(),
            size: 1,
            otp: 0,
        };
        assert_eq!(update.image_url("h"), "http://h/images/a.bin");

        update.url = String::from("https://cdn/a.bin");
        assert_eq!(update.image_url("h"), "https://cdn/a.bin");
    }

    #[test]
    fn test_update_with_valid_otp() {
        let ctx = device();
        let mut store = MemoryStore::new();
        let payload = update_payload(CODE);
        store.insert("zero:config:update", &payload);
        let mut handler = FirmwareUpdateHandler::new(FakeUpdater::default());

        let outcome = block_on(poll(
            &ctx,
            &mut store,
            FIRMWARE_UPDATE_SUFFIX,
            &mut handler,
            UPTIME,
        ));

        assert_eq!(outcome, Ok(PollOutcome::Consumed));
        assert!(handler.restart_pending());
        assert_eq!(
            handler.updater().urls,
            [String::from("http://updates.local/zero_watch_updates/zw-0.2.1.bin")]
        );
        let response = format!("zero:config:update:{}", payload);
        assert_eq!(store.value(&response), Some("{\"ok\":true}"));
        assert_eq!(store.value("zero:config:update"), None);
    }

    #[test]
    fn test_update_otp_mismatch_is_retained() {
        let ctx = device();
        let mut store = MemoryStore::new();
        let payload = update_payload(CODE + 1);
        store.insert("zero:config:update", &payload);
        let mut handler = FirmwareUpdateHandler::new(FakeUpdater::default());

        let outcome = block_on(poll(
            &ctx,
            &mut store,
            FIRMWARE_UPDATE_SUFFIX,
            &mut handler,
            UPTIME,
        ));

        assert_eq!(
            outcome,
            Ok(PollOutcome::Retained(HandlerFailure::OtpMismatch))
        );
        assert!(handler.updater().urls.is_empty());
        assert!(!handler.restart_pending());
        assert_eq!(store.value("zero:config:update"), Some(payload.as_str()));
        let response = format!("zero:config:update:{}", payload);
        assert_eq!(
            store.value(&response),
            Some("{\"ok\":false,\"error\":\"otp mismatch\"}")
        );
    }

    #[test]
    fn test_update_before_first_window_is_unavailable() {
        let ctx = device();
        let mut store = MemoryStore::new();
        store.insert("zero:config:update", &update_payload(CODE));
        let mut handler = FirmwareUpdateHandler::new(FakeUpdater::default());

        let outcome = block_on(poll(
            &ctx,
            &mut store,
            FIRMWARE_UPDATE_SUFFIX,
            &mut handler,
            Instant::from_secs(30),
        ));

        assert_eq!(
            outcome,
            Ok(PollOutcome::Retained(HandlerFailure::OtpUnavailable))
        );
        assert!(handler.updater().urls.is_empty());
    }

    #[test]
    fn test_update_failure_is_retained() {
        let ctx = device();
        let mut store = MemoryStore::new();
        store.insert("zero:config:update", &update_payload(CODE));
        let mut handler = FirmwareUpdateHandler::new(FakeUpdater {
            fail: true,
            ..Default::default()
        });

        let outcome = block_on(poll(
            &ctx,
            &mut store,
            FIRMWARE_UPDATE_SUFFIX,
            &mut handler,
            UPTIME,
        ));

        assert_eq!(outcome, Ok(PollOutcome::Retained(HandlerFailure::Action)));
        assert!(!handler.restart_pending());
    }

    #[test]
    fn test_update_bad_payload() {
        let ctx = device();
        let mut store = MemoryStore::new();
        store.insert("zero:config:update", "not json");
        let mut handler = FirmwareUpdateHandler::new(FakeUpdater::default());

        let outcome = block_on(poll(
            &ctx,
            &mut store,
            FIRMWARE_UPDATE_SUFFIX,
            &mut handler,
            UPTIME,
        ));

        assert_eq!(
            outcome,
            Ok(PollOutcome::Retained(HandlerFailure::BadPayload))
        );
        assert_eq!(
            store.value("zero:config:update:not json"),
            Some("{\"ok\":false,\"error\":\"bad payload\"}")
        );
    }

    #[test]
    fn test_config_apply_without_otp() {
        let ctx = device();
        let mut store = MemoryStore::new();
        store.insert("zero:config:apply", "{\"brightness\":3,\"pauseRefresh\":true}");
        let mut handler = ConfigApplyHandler::new(AppConfig::default());

        let outcome = block_on(poll(
            &ctx,
            &mut store,
            CONFIG_APPLY_SUFFIX,
            &mut handler,
            Instant::from_secs(1),
        ));

        assert_eq!(outcome, Ok(PollOutcome::Consumed));
        assert_eq!(
            handler.take_pending(),
            Some(AppConfig {
                brightness: 3,
                pause_refresh: true,
                ..AppConfig::default()
            })
        );
        assert_eq!(handler.take_pending(), None);
    }

    #[test]
    fn test_config_apply_deep_sleep_needs_otp() {
        let ctx = device();
        let mut store = MemoryStore::new();
        store.insert("zero:config:apply", "{\"deepSleepMode\":true}");
        let mut handler = ConfigApplyHandler::new(AppConfig::default());

        let outcome = block_on(poll(
            &ctx,
            &mut store,
            CONFIG_APPLY_SUFFIX,
            &mut handler,
            UPTIME,
        ));
        assert_eq!(
            outcome,
            Ok(PollOutcome::Retained(HandlerFailure::OtpMismatch))
        );
        assert_eq!(handler.take_pending(), None);

        store.insert("zero:config:apply", "{\"deepSleepMode\":true,\"otp\":550}");
        let outcome = block_on(poll(
            &ctx,
            &mut store,
            CONFIG_APPLY_SUFFIX,
            &mut handler,
            UPTIME,
        ));
        assert_eq!(outcome, Ok(PollOutcome::Consumed));
        assert!(handler.current().deep_sleep_mode);
    }

    #[test]
    fn test_command_table_dispatch() {
        let ctx = device();
        let mut store = MemoryStore::new();
        store.insert("zero:config:apply", "{\"debug\":true}");
        store.insert("zero:config:update", &update_payload(CODE));

        let mut table = CommandTable::new();
        for command in [
            Command::ConfigApply(ConfigApplyHandler::new(AppConfig::default())),
            Command::FirmwareUpdate(FirmwareUpdateHandler::new(FakeUpdater::default())),
        ] {
            table.register(command.suffix(), command);
        }

        let summary = block_on(table.poll_all(&ctx, &mut store, UPTIME));
        assert_eq!(summary.consumed, 2);

        match table.get_mut(FIRMWARE_UPDATE_SUFFIX) {
            Some(Command::FirmwareUpdate(handler)) => assert!(handler.restart_pending()),
            _ => panic!("update handler missing"),
        }
        match table.get_mut(CONFIG_APPLY_SUFFIX) {
            Some(Command::ConfigApply(handler)) => {
                assert!(handler.take_pending().is_some_and(|c| c.debug))
            }
            _ => panic!("apply handler missing"),
        }
    }
}
