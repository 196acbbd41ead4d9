//! Event surface for capture channels.
//!
//! This module provides:
//! - [`EventBus`] trait for supervisors to publish channel events
//! - The typed event payloads observable per channel
//!
//! Every event a supervisor publishes for one channel is totally ordered: the
//! state machine is single-owner and emits from one task.

mod bus;

pub use bus::{EventBus, LoggingEventBus, NoopEventBus};

use std::fmt;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::RecoveryReason;

/// Backoff metadata attached to every recover event.
///
/// `applied_jitter_ms` is `delay_ms - base_delay_ms`, so observability always
/// reflects the clamped delay rather than the raw jitter draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffMeta {
    pub base_delay_ms: u64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub applied_jitter_ms: i64,
}

/// Emitted on every entry into the recovering state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverEvent {
    /// Why the pipeline is restarting.
    pub reason: RecoveryReason,
    /// Consecutive recovery cycles since the last successful byte.
    pub attempt: u32,
    /// Scheduled delay before the next spawn.
    pub delay_ms: u64,
    pub meta: BackoffMeta,
    /// Human-readable detail of the triggering fault, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The failure that tripped the circuit breaker.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastFailure {
    pub reason: RecoveryReason,
}

/// Emitted exactly once when a channel latches into the broken state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FatalEvent {
    /// Always `"circuit-breaker"`; kept as a field for forward compatibility
    /// of the wire format.
    pub reason: &'static str,
    pub channel: String,
    /// Attempt counter at the moment the breaker latched.
    pub attempts: u32,
    pub last_failure: LastFailure,
}

impl FatalEvent {
    /// Builds the circuit-breaker fatal payload.
    #[must_use]
    pub fn circuit_breaker(channel: impl Into<String>, attempts: u32, reason: RecoveryReason) -> Self {
        Self {
            reason: "circuit-breaker",
            channel: channel.into(),
            attempts,
            last_failure: LastFailure { reason },
        }
    }
}

/// Raw byte-stream access for one attach.
///
/// Published once per successful attach for callers that need the unframed
/// child output (e.g. diagnostics taps). Subscribers receive every chunk the
/// supervisor reads from that child's stdout.
#[derive(Clone)]
pub struct RawStreamHandle {
    tx: broadcast::Sender<Bytes>,
}

impl RawStreamHandle {
    pub(crate) fn new(tx: broadcast::Sender<Bytes>) -> Self {
        Self { tx }
    }

    /// Subscribes to the raw chunk stream of this attach.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.tx.subscribe()
    }
}

impl fmt::Debug for RawStreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawStreamHandle")
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}

/// Events observable per capture channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// One complete framed sensor unit (PCM frame or PNG image).
    Data { unit: Bytes },
    /// Opaque diagnostic line from the child's stderr.
    Stderr { line: String },
    /// A non-fatal fault, signalled alongside a recover.
    Error {
        kind: RecoveryReason,
        message: String,
    },
    /// The child process exited.
    Close { exit_code: Option<i32> },
    /// A restart has been scheduled.
    Recover(RecoverEvent),
    /// The circuit breaker latched; the channel is broken.
    Fatal(FatalEvent),
    /// Raw stream access, published once per attach.
    Stream(RawStreamHandle),
}

impl ChannelEvent {
    /// Short name of the event variant, for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Data { .. } => "data",
            Self::Stderr { .. } => "stderr",
            Self::Error { .. } => "error",
            Self::Close { .. } => "close",
            Self::Recover(_) => "recover",
            Self::Fatal(_) => "fatal",
            Self::Stream(_) => "stream",
        }
    }
}
