//! The capture pipeline supervisor and its components.
//!
//! Per channel, a [`PipelineSupervisor`](supervisor::PipelineSupervisor)
//! owns one transcoder child process and keeps capture alive across every
//! failure mode an operator will meet in the field. The supporting pieces:
//!
//! - [`frame`]: byte stream -> complete sensor units (PCM frames / PNGs)
//! - [`silence`]: per-frame acoustic health evaluation
//! - [`backoff`]: restart delays with injected jitter
//! - [`timers`]: the five named single-shot timers per pipeline
//! - [`ladder`]: device/binary fallback rotation with success memory
//! - [`command`]: the bit-exact transcoder invocation contract
//! - [`process`]: child ownership and the termination protocol
//! - [`devices`]: the optional audio device discovery probe

pub mod backoff;
pub mod command;
pub mod devices;
pub mod frame;
pub mod ladder;
pub mod process;
pub mod silence;
pub mod supervisor;
pub mod timers;

pub use backoff::{BackoffPolicy, ComputedDelay};
pub use command::{build_spec, CommandSpec, LEGACY_BINARY, STANDARD_BINARY};
pub use devices::{parse_device_lines, probe_devices};
pub use frame::{PcmFrameAssembler, PngFrameAssembler, UnitAssembler, PNG_SIGNATURE};
pub use ladder::{Candidate, CandidateSpec, FallbackLadder, LadderMemory, MIC_PLATFORM_TABLE};
pub use process::{
    exit_pair, ChildControl, ExitGate, ExitNotice, LaunchedChild, ProcessLauncher, SystemLauncher,
};
pub use silence::{SilenceMonitor, SilenceVerdict};
pub use supervisor::{PipelineState, PipelineSupervisor, SupervisorDeps};
pub use timers::{TimerBundle, TimerKind};
