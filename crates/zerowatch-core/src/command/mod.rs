//! Command/response protocol over the shared store
//!
//! A backend leaves a request at `<id><suffix>`. Each poll reads it, hands the
//! raw payload to a [`CommandHandler`] together with a [`Responder`] bound to
//! the correlation key `<id><suffix>:<payload>`, and acknowledges the request
//! by deleting it only when the handler succeeds. A failed request stays in
//! place and is offered again on the next poll.
//!
//! Responses are best effort: they are published on the correlation key's
//! channel, stored there with a TTL, and never read back by the device.

pub mod handlers;

pub use handlers::{
    CONFIG_APPLY_SUFFIX, Command, ConfigApplyHandler, ConfigPatch, FIRMWARE_UPDATE_SUFFIX,
    FirmwareUpdateHandler, FirmwareUpdater, UpdateRequest,
};

use alloc::vec::Vec;

use embassy_time::{Duration, Instant};
use log::{debug, error, info, warn};
use thiserror_no_std::Error;

use crate::app_state::{DeviceContext, Severity};
use crate::store::{KeyValueStore, StoreError, correlation_key};

/// Lifetime of a stored response
pub const DEFAULT_RESPONSE_TTL: Duration = Duration::from_secs(120);

/// Why a handler refused or failed a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerFailure {
    /// The supplied code does not match the current window
    OtpMismatch,
    /// The device has not been up long enough for any code to exist
    OtpUnavailable,
    /// The payload could not be decoded
    BadPayload,
    /// The action itself failed
    Action,
}

impl HandlerFailure {
    /// An early code only needs more uptime; everything else may succeed on
    /// a later poll as is.
    pub fn severity(&self) -> Severity {
        match self {
            Self::OtpUnavailable => Severity::PendingUptime,
            Self::OtpMismatch | Self::BadPayload | Self::Action => Severity::Retryable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Success,
    Failure(HandlerFailure),
}

/// Result of polling one suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing waiting
    Idle,
    /// The handler failed; the request is left for the next poll
    Retained(HandlerFailure),
    /// The handler succeeded and the request was deleted
    Consumed,
    /// The request could not be read as text and was deleted unanswered
    Discarded(HandlerFailure),
}

impl PollOutcome {
    pub fn is_consumed(&self) -> bool {
        matches!(self, Self::Consumed)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("response not stored: {0}")]
pub struct ResponderError(pub StoreError);

/// Writes responses to one correlation key
pub struct Responder<'a, S> {
    store: &'a mut S,
    key: &'a str,
    ttl: Duration,
}

impl<'a, S: KeyValueStore> Responder<'a, S> {
    pub fn new(store: &'a mut S, key: &'a str) -> Self {
        Self {
            store,
            key,
            ttl: DEFAULT_RESPONSE_TTL,
        }
    }

    /// Override the response lifetime; zero leaves responses without expiry.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn key(&self) -> &str {
        self.key
    }

    /// Publish `message` on the correlation channel and store it with the TTL.
    ///
    /// A failed publish is only logged. A failed store write is logged and
    /// returned; it is never retried.
    pub async fn set_value(&mut self, message: &str) -> Result<(), ResponderError> {
        if let Err(e) = self.store.publish(self.key, message).await {
            warn!("responder: publish on {} failed: {}", self.key, e);
        }

        if let Err(e) = self.store.set(self.key, message).await {
            error!("responder: set of {} failed: {}", self.key, e);
            return Err(ResponderError(e));
        }

        if self.ttl > Duration::from_ticks(0) {
            debug!("responder: expiring {} in {} s", self.key, self.ttl.as_secs());
            if let Err(e) = self.store.expire(self.key, self.ttl).await {
                warn!("responder: expire of {} failed: {}", self.key, e);
            }
        }

        Ok(())
    }
}

/// What a handler gets to work with on each request
pub struct CommandRequest<'a> {
    /// Raw value found at the request key
    pub payload: &'a str,
    pub device: &'a DeviceContext,
    /// Device uptime when the request was read
    pub uptime: Instant,
}

/// One kind of remote command
#[allow(async_fn_in_trait)]
pub trait CommandHandler {
    async fn handle<S: KeyValueStore>(
        &mut self,
        request: &CommandRequest<'_>,
        responder: &mut Responder<'_, S>,
    ) -> HandlerOutcome;
}

/// Poll the request key `<id><suffix>` once.
///
/// An empty or missing request is [`PollOutcome::Idle`] and touches nothing.
/// A request that is not UTF-8 can never be answered, since its correlation
/// key cannot be formed, so it is deleted. Only transport failures are
/// returned as errors.
pub async fn poll<S, H>(
    device: &DeviceContext,
    store: &mut S,
    suffix: &str,
    handler: &mut H,
    uptime: Instant,
) -> Result<PollOutcome, StoreError>
where
    S: KeyValueStore,
    H: CommandHandler,
{
    let request_key = device.key(suffix);
    let payload = match store.get(&request_key).await {
        Ok(Some(payload)) if !payload.is_empty() => payload,
        Ok(_) => return Ok(PollOutcome::Idle),
        Err(StoreError::NotUtf8) => {
            warn!("command: {} is not text, discarding", request_key);
            store.del(&request_key).await?;
            return Ok(PollOutcome::Discarded(HandlerFailure::BadPayload));
        }
        Err(e) => return Err(e),
    };

    let response_key = correlation_key(device.identity(), suffix, &payload);
    debug!("command: {} answers on '{}'", request_key, response_key);

    let request = CommandRequest {
        payload: &payload,
        device,
        uptime,
    };
    let outcome = {
        let mut responder = Responder::new(store, &response_key);
        handler.handle(&request, &mut responder).await
    };

    match outcome {
        HandlerOutcome::Success => {
            if !store.del(&request_key).await? {
                warn!("command: {} was already gone", request_key);
            }
            info!("command: {} consumed", request_key);
            Ok(PollOutcome::Consumed)
        }
        HandlerOutcome::Failure(failure) => {
            warn!(
                "command: {} retained ({:?}, {:?})",
                request_key,
                failure,
                failure.severity()
            );
            Ok(PollOutcome::Retained(failure))
        }
    }
}

/// Counts from one [`CommandTable::poll_all`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub consumed: usize,
    pub retained: usize,
    pub idle: usize,
    pub discarded: usize,
    /// Suffixes skipped because the store failed
    pub errors: usize,
}

/// Handlers keyed by request suffix, polled in registration order
pub struct CommandTable<H> {
    entries: Vec<(&'static str, H)>,
}

impl<H: CommandHandler> CommandTable<H> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register `handler` for `suffix`, replacing any earlier registration.
    pub fn register(&mut self, suffix: &'static str, handler: H) {
        match self.entries.iter_mut().find(|(s, _)| *s == suffix) {
            Some(entry) => entry.1 = handler,
            None => self.entries.push((suffix, handler)),
        }
    }

    pub fn get_mut(&mut self, suffix: &str) -> Option<&mut H> {
        self.entries
            .iter_mut()
            .find(|(s, _)| *s == suffix)
            .map(|(_, h)| h)
    }

    pub fn handlers_mut(&mut self) -> impl Iterator<Item = &mut H> {
        self.entries.iter_mut().map(|(_, h)| h)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Poll every registered suffix once.
    ///
    /// A store failure on one suffix is counted and the rest are still
    /// polled.
    pub async fn poll_all<S: KeyValueStore>(
        &mut self,
        device: &DeviceContext,
        store: &mut S,
        uptime: Instant,
    ) -> PollSummary {
        let mut summary = PollSummary::default();
        for (suffix, handler) in self.entries.iter_mut() {
            match poll(device, &mut *store, suffix, handler, uptime).await {
                Ok(PollOutcome::Idle) => summary.idle += 1,
                Ok(PollOutcome::Consumed) => summary.consumed += 1,
                Ok(PollOutcome::Retained(_)) => summary.retained += 1,
                Ok(PollOutcome::Discarded(_)) => summary.discarded += 1,
                Err(e) => {
                    error!("command: polling {} failed: {}", suffix, e);
                    summary.errors += 1;
                }
            }
        }
        summary
    }
}

impl<H: CommandHandler> Default for CommandTable<H> {
    fn default() -> Self {
        Self::new()
    }
}
