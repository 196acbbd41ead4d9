//! Metrics surface for capture pipelines.
//!
//! Supervisors record restarts and device discoveries through the
//! [`CaptureMetrics`] trait; the [`MetricsRegistry`] implementation keeps
//! thread-safe counters that observability consumers snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use crate::config::ChannelKind;
use crate::error::RecoveryReason;

/// Context recorded with every pipeline restart.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartMeta {
    pub channel: String,
    pub attempt: u32,
    pub delay_ms: u64,
    pub base_delay_ms: u64,
    pub applied_jitter_ms: i64,
}

/// Context recorded with every audio device discovery.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryMeta {
    pub channel: String,
    pub format: String,
    /// Number of devices the probe reported, when it completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_count: Option<usize>,
}

/// Trait for recording supervisor metrics without knowledge of the registry.
pub trait CaptureMetrics: Send + Sync {
    /// Records one transition into the recovering state.
    fn record_pipeline_restart(&self, kind: ChannelKind, reason: RecoveryReason, meta: &RestartMeta);

    /// Records one audio device discovery outcome
    /// (`probe`, `cached`, `timeout`, `failed`).
    fn record_audio_device_discovery(&self, reason: &str, meta: &DiscoveryMeta);
}

/// No-op metrics for callers that only consume events.
pub struct NoopMetrics;

impl CaptureMetrics for NoopMetrics {
    fn record_pipeline_restart(
        &self,
        _kind: ChannelKind,
        _reason: RecoveryReason,
        _meta: &RestartMeta,
    ) {
        // No-op
    }

    fn record_audio_device_discovery(&self, _reason: &str, _meta: &DiscoveryMeta) {
        // No-op
    }
}

/// Restart counters for one channel kind.
#[derive(Default)]
struct PipelineCounters {
    total: AtomicU64,
    by_reason: DashMap<&'static str, u64>,
}

impl PipelineCounters {
    fn record(&self, reason: RecoveryReason) {
        self.total.fetch_add(1, Ordering::Relaxed);
        *self.by_reason.entry(reason.as_str()).or_insert(0) += 1;
    }

    fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            total: self.total.load(Ordering::Relaxed),
            by_reason: self
                .by_reason
                .iter()
                .map(|r| (r.key().to_string(), *r.value()))
                .collect(),
        }
    }
}

/// Point-in-time view of one kind's restart counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSnapshot {
    pub total: u64,
    pub by_reason: HashMap<String, u64>,
}

/// Point-in-time view of the whole registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Unix timestamp (ms) at which the snapshot was taken.
    pub captured_at_ms: u64,
    pub audio: PipelineSnapshot,
    pub video: PipelineSnapshot,
    pub device_discoveries: HashMap<String, u64>,
}

/// Thread-safe registry of capture metrics.
///
/// Supervisors append concurrently; counters are atomics or sharded maps, so
/// recording never blocks a pipeline task on another channel.
#[derive(Default)]
pub struct MetricsRegistry {
    audio: PipelineCounters,
    video: PipelineCounters,
    device_discoveries: DashMap<String, u64>,
}

impl MetricsRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, kind: ChannelKind) -> &PipelineCounters {
        match kind {
            ChannelKind::Audio => &self.audio,
            ChannelKind::Video => &self.video,
        }
    }

    /// Total restarts recorded for a kind.
    #[must_use]
    pub fn restarts_total(&self, kind: ChannelKind) -> u64 {
        self.counters(kind).total.load(Ordering::Relaxed)
    }

    /// Restarts recorded for a kind and reason.
    #[must_use]
    pub fn restarts_by_reason(&self, kind: ChannelKind, reason: RecoveryReason) -> u64 {
        self.counters(kind)
            .by_reason
            .get(reason.as_str())
            .map_or(0, |r| *r.value())
    }

    /// Device discoveries recorded for an outcome.
    #[must_use]
    pub fn device_discoveries(&self, reason: &str) -> u64 {
        self.device_discoveries.get(reason).map_or(0, |r| *r.value())
    }

    /// Snapshots all counters for observability consumers.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            captured_at_ms: crate::utils::now_millis(),
            audio: self.audio.snapshot(),
            video: self.video.snapshot(),
            device_discoveries: self
                .device_discoveries
                .iter()
                .map(|r| (r.key().clone(), *r.value()))
                .collect(),
        }
    }
}

impl CaptureMetrics for MetricsRegistry {
    fn record_pipeline_restart(
        &self,
        kind: ChannelKind,
        reason: RecoveryReason,
        meta: &RestartMeta,
    ) {
        log::debug!(
            "[Metrics] restart recorded: kind={}, reason={}, channel={}, attempt={}, delay={}ms",
            kind,
            reason,
            meta.channel,
            meta.attempt,
            meta.delay_ms
        );
        self.counters(kind).record(reason);
    }

    fn record_audio_device_discovery(&self, reason: &str, meta: &DiscoveryMeta) {
        log::debug!(
            "[Metrics] device discovery recorded: reason={}, channel={}, format={}",
            reason,
            meta.channel,
            meta.format
        );
        *self
            .device_discoveries
            .entry(reason.to_string())
            .or_insert(0) += 1;
    }
}
