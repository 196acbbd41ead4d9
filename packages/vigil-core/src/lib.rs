//! Vigil Core - capture supervision library for surveillance sensors.
//!
//! This crate provides the capture pipeline supervisor at the heart of
//! Vigil: per channel (one camera or microphone) it spawns an external
//! transcoder helper, reframes its byte stream into discrete sensor units,
//! delivers units to downstream detectors, and keeps capture alive across
//! every failure mode an operator will encounter in the field.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`capture`]: the per-channel supervisor and its components
//! - [`config`]: per-channel configuration with kind-specific defaults
//! - [`events`]: the typed event surface published per channel
//! - [`metrics`]: restart/discovery counters shared across channels
//! - [`error`]: centralized error types and the recovery-reason contract
//!
//! # Abstraction Traits
//!
//! The crate defines several traits to decouple the supervisor from its
//! environment:
//!
//! - [`EventBus`](events::EventBus): publishing channel events
//! - [`CaptureMetrics`](metrics::CaptureMetrics): recording restarts
//! - [`ProcessLauncher`](capture::ProcessLauncher): spawning children
//!
//! Each trait has a default implementation suitable for headless use; tests
//! substitute recorders and scripted launchers.

#![warn(clippy::all)]

pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod utils;

// Re-export commonly used types at the crate root
pub use capture::{
    BackoffPolicy, Candidate, CandidateSpec, ExitGate, ExitNotice, FallbackLadder, LaunchedChild,
    PcmFrameAssembler, PipelineState, PipelineSupervisor, PngFrameAssembler, ProcessLauncher,
    SilenceMonitor, SilenceVerdict, SupervisorDeps, SystemLauncher, TimerKind, UnitAssembler,
};
pub use config::{ChannelConfig, ChannelKind, RandomSource};
pub use error::{FrameError, LaunchError, ProbeError, RecoveryReason};
pub use events::{
    BackoffMeta, ChannelEvent, EventBus, FatalEvent, LastFailure, LoggingEventBus, NoopEventBus,
    RawStreamHandle, RecoverEvent,
};
pub use metrics::{
    CaptureMetrics, DiscoveryMeta, MetricsRegistry, MetricsSnapshot, NoopMetrics, RestartMeta,
};
pub use utils::now_millis;
