//! Centralized error types for the Vigil core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Exposes the closed recovery-reason enumeration that metrics and
//!   downstream alerting key on

use serde::Serialize;
use thiserror::Error;

use crate::config::ChannelKind;

/// Why a capture pipeline entered recovery.
///
/// Closed enumeration; the kebab-case strings returned by
/// [`RecoveryReason::as_str`] are an external-surface contract shared with
/// metrics dashboards and operator runbooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryReason {
    /// No usable transcoder binary was found on any candidate.
    BinaryMissing,
    /// The transcoder binary exists but could not be started.
    SpawnError,
    /// The child process exited on its own.
    ProcessExit,
    /// No bytes arrived within the idle window.
    StreamIdle,
    /// The acoustic monitor saw only silence for the configured window.
    StreamSilence,
    /// A transport-level stream fault (misaligned pipe chunk, read error).
    StreamError,
    /// No bytes arrived within the watchdog window.
    WatchdogTimeout,
    /// No complete unit arrived within the startup window.
    StartTimeout,
    /// The audio device enumeration probe did not finish in time.
    DeviceDiscoveryTimeout,
    /// The reassembly buffer overflowed without producing a unit.
    CorruptedFrame,
}

impl RecoveryReason {
    /// Returns the wire/metric name of the reason.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::BinaryMissing => "binary-missing",
            Self::SpawnError => "spawn-error",
            Self::ProcessExit => "process-exit",
            Self::StreamIdle => "stream-idle",
            Self::StreamSilence => "stream-silence",
            Self::StreamError => "stream-error",
            Self::WatchdogTimeout => "watchdog-timeout",
            Self::StartTimeout => "start-timeout",
            Self::DeviceDiscoveryTimeout => "device-discovery-timeout",
            Self::CorruptedFrame => "corrupted-frame",
        }
    }

    /// Whether the fallback ladder advances to its next candidate on this
    /// reason.
    ///
    /// Device-health reasons rotate; transient spawn/exit reasons hold the
    /// current candidate because the device is unlikely to be at fault.
    #[must_use]
    pub const fn rotates_candidate(&self) -> bool {
        matches!(
            self,
            Self::StreamSilence | Self::WatchdogTimeout | Self::DeviceDiscoveryTimeout
        )
    }

    /// Whether this reason increments the circuit-breaker counter for the
    /// given channel kind.
    #[must_use]
    pub const fn counts_toward_breaker(&self, kind: ChannelKind) -> bool {
        match kind {
            ChannelKind::Audio => matches!(self, Self::StreamSilence | Self::WatchdogTimeout),
            ChannelKind::Video => matches!(self, Self::WatchdogTimeout),
        }
    }
}

impl std::fmt::Display for RecoveryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the frame reassemblers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// An aligned-pipe chunk was not a whole multiple of the sample frame.
    #[error("chunk of {len} bytes is not aligned to the {align}-byte sample frame")]
    Misaligned { len: usize, align: usize },

    /// The reassembly buffer exceeded its cap without yielding a unit.
    #[error("reassembly buffer exceeded {cap} bytes without a complete unit")]
    BufferOverflow { cap: usize },
}

impl FrameError {
    /// Maps the framing fault to the recovery reason the supervisor reports.
    #[must_use]
    pub const fn recovery_reason(&self) -> RecoveryReason {
        match self {
            Self::Misaligned { .. } => RecoveryReason::StreamError,
            Self::BufferOverflow { .. } => RecoveryReason::CorruptedFrame,
        }
    }
}

/// Errors raised while spawning a transcoder child process.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The binary does not exist on PATH (ENOENT-equivalent).
    #[error("transcoder binary not found: {0}")]
    NotFound(String),

    /// The binary exists but spawning failed for another reason.
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
}

impl LaunchError {
    /// Whether the error is a not-found miss (advances the binary list
    /// rather than the candidate ladder).
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Errors raised by the audio device enumeration probe.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The probe process did not finish within its timeout.
    #[error("device probe timed out after {0}ms")]
    Timeout(u64),

    /// The probe process could not be spawned.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// Reading the probe output failed.
    #[error("device probe i/o error: {0}")]
    Io(#[from] std::io::Error),
}
