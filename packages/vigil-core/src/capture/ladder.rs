//! Fallback ladder: the ordered device/binary candidates a pipeline rotates
//! through on targeted failures.
//!
//! The ladder is rebuilt on every `start()`, but the indices of the last
//! successful candidate and binary live in a shared [`LadderMemory`] so a
//! healthy channel skips probing dead entries across stop/start cycles.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{ChannelConfig, ChannelKind};
use crate::error::RecoveryReason;

use super::command::binary_list;

/// Operator-facing candidate description used in `mic_fallbacks` overrides.
///
/// Missing fields inherit the platform defaults at ladder construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSpec {
    pub format: Option<String>,
    pub device: Option<String>,
}

/// A concrete spawn candidate: the input arguments plus its identity key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub input_format: Option<String>,
    pub device: Option<String>,
    /// Ordered input arguments (e.g. `-f alsa -i default`).
    pub input_args: Vec<String>,
}

impl Candidate {
    /// Builds a device-capture candidate for a (format, device) pair.
    #[must_use]
    pub fn for_device(format: &str, device: &str) -> Self {
        Self {
            input_format: Some(format.to_string()),
            device: Some(device.to_string()),
            input_args: vec![
                "-f".to_string(),
                format.to_string(),
                "-i".to_string(),
                device.to_string(),
            ],
        }
    }

    /// De-duplication key: `(format || "none", device)`.
    fn dedup_key(&self) -> (String, Option<String>) {
        (
            self.input_format
                .clone()
                .unwrap_or_else(|| "none".to_string()),
            self.device.clone(),
        )
    }

    /// Short label for logs.
    #[must_use]
    pub fn label(&self) -> String {
        format!(
            "{}:{}",
            self.input_format.as_deref().unwrap_or("none"),
            self.device.as_deref().unwrap_or("-")
        )
    }
}

/// Compile-time microphone defaults for one platform.
#[derive(Debug, Clone, Copy)]
pub struct MicPlatformDefaults {
    pub os: &'static str,
    pub format: &'static str,
    pub device: &'static str,
    /// Platform-specific (format, device) fallbacks tried after the default.
    pub fallbacks: &'static [(&'static str, &'static str)],
}

/// Microphone capture defaults keyed by OS tag.
pub const MIC_PLATFORM_TABLE: &[MicPlatformDefaults] = &[
    MicPlatformDefaults {
        os: "linux",
        format: "alsa",
        device: "default",
        fallbacks: &[("alsa", "hw:0"), ("alsa", "plughw:0")],
    },
    MicPlatformDefaults {
        os: "macos",
        format: "avfoundation",
        device: ":0",
        fallbacks: &[],
    },
    MicPlatformDefaults {
        os: "windows",
        format: "dshow",
        device: "audio=default",
        fallbacks: &[],
    },
];

/// Looks up the microphone defaults for an OS tag.
#[must_use]
pub fn platform_defaults(os: &str) -> Option<&'static MicPlatformDefaults> {
    MIC_PLATFORM_TABLE.iter().find(|entry| entry.os == os)
}

/// Last-success indices shared across ladder rebuilds.
#[derive(Debug, Default)]
pub struct LadderMemory {
    last_candidate: AtomicUsize,
    last_binary: AtomicUsize,
}

impl LadderMemory {
    /// Creates empty memory starting both indices at 0.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// The ordered (binary x candidate) search space of one pipeline.
#[derive(Debug)]
pub struct FallbackLadder {
    candidates: Vec<Candidate>,
    candidate_index: usize,
    binaries: Vec<String>,
    binary_index: usize,
    memory: Arc<LadderMemory>,
}

impl FallbackLadder {
    /// Builds the ladder for a channel, resuming from remembered indices.
    #[must_use]
    pub fn for_channel(config: &ChannelConfig, os: &str, memory: Arc<LadderMemory>) -> Self {
        let candidates = match config.kind {
            ChannelKind::Audio => audio_candidates(config, os),
            ChannelKind::Video => vec![video_candidate(config)],
        };
        let binaries = binary_list(config.binary_path.as_deref());
        let candidate_index = memory.last_candidate.load(Ordering::Relaxed) % candidates.len();
        let binary_index = memory.last_binary.load(Ordering::Relaxed) % binaries.len();
        Self {
            candidates,
            candidate_index,
            binaries,
            binary_index,
            memory,
        }
    }

    #[must_use]
    pub fn current_candidate(&self) -> &Candidate {
        &self.candidates[self.candidate_index]
    }

    #[must_use]
    pub fn current_binary(&self) -> &str {
        &self.binaries[self.binary_index]
    }

    #[must_use]
    pub fn candidate_index(&self) -> usize {
        self.candidate_index
    }

    #[must_use]
    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    #[must_use]
    pub fn binary_count(&self) -> usize {
        self.binaries.len()
    }

    /// Advances to the next binary (wrapping). Used on not-found errors.
    pub fn advance_binary(&mut self) {
        self.binary_index = (self.binary_index + 1) % self.binaries.len();
    }

    /// Advances to the next candidate (wrapping).
    pub fn advance_candidate(&mut self) {
        self.candidate_index = (self.candidate_index + 1) % self.candidates.len();
    }

    /// Rotates the candidate when the recovery reason is device-targeted.
    ///
    /// Returns whether a rotation happened.
    pub fn rotate_for(&mut self, reason: RecoveryReason) -> bool {
        if reason.rotates_candidate() {
            let previous = self.candidate_index;
            self.advance_candidate();
            log::debug!(
                "[Ladder] rotated candidate {} -> {} ({})",
                previous,
                self.candidate_index,
                self.current_candidate().label()
            );
            true
        } else {
            false
        }
    }

    /// Records the active candidate as the known-good entry.
    pub fn mark_candidate_success(&self) {
        self.memory
            .last_candidate
            .store(self.candidate_index, Ordering::Relaxed);
    }

    /// Records the active binary as the known-good entry.
    pub fn mark_binary_success(&self) {
        self.memory
            .last_binary
            .store(self.binary_index, Ordering::Relaxed);
    }
}

/// Builds the audio candidate ladder for one channel.
fn audio_candidates(config: &ChannelConfig, os: &str) -> Vec<Candidate> {
    // Pipe and URI inputs have exactly one way to be opened.
    if !config.is_mic_input() {
        let mut input_args = Vec::new();
        if let Some(format) = &config.input_format {
            input_args.push("-f".to_string());
            input_args.push(format.clone());
        }
        input_args.push("-i".to_string());
        input_args.push(config.input.clone());
        return vec![Candidate {
            input_format: config.input_format.clone(),
            device: None,
            input_args,
        }];
    }

    let defaults = platform_defaults(os);
    let mut candidates = Vec::new();

    // The operator-selected (format, device) leads the ladder; missing halves
    // inherit the platform defaults.
    if config.input_format.is_some() || config.device.is_some() {
        let format = config
            .input_format
            .clone()
            .or_else(|| defaults.map(|d| d.format.to_string()));
        let device = config
            .device
            .clone()
            .or_else(|| defaults.map(|d| d.device.to_string()));
        if let (Some(format), Some(device)) = (format, device) {
            candidates.push(Candidate::for_device(&format, &device));
        }
    }

    if let Some(defaults) = defaults {
        candidates.push(Candidate::for_device(defaults.format, defaults.device));
        for (format, device) in defaults.fallbacks {
            candidates.push(Candidate::for_device(format, device));
        }
    }

    // Operator overrides: platform-specific entries first, then wildcard.
    for key in [os, "*"] {
        if let Some(specs) = config.mic_fallbacks.get(key) {
            for spec in specs {
                let format = spec
                    .format
                    .clone()
                    .or_else(|| defaults.map(|d| d.format.to_string()));
                let device = spec
                    .device
                    .clone()
                    .or_else(|| defaults.map(|d| d.device.to_string()));
                if let (Some(format), Some(device)) = (format, device) {
                    candidates.push(Candidate::for_device(&format, &device));
                }
            }
        }
    }

    // Unknown platform with no configuration still needs one entry to try.
    if candidates.is_empty() {
        candidates.push(Candidate {
            input_format: None,
            device: Some("default".to_string()),
            input_args: vec!["-i".to_string(), "default".to_string()],
        });
    }

    dedup_candidates(candidates)
}

/// Builds the single video candidate from the input URI.
fn video_candidate(config: &ChannelConfig) -> Candidate {
    let mut input_args = Vec::new();
    if let Some(transport) = &config.transport {
        if config.input.starts_with("rtsp://") {
            input_args.push("-rtsp_transport".to_string());
            input_args.push(transport.clone());
        }
    }
    input_args.push("-i".to_string());
    input_args.push(config.input.clone());
    Candidate {
        input_format: None,
        device: None,
        input_args,
    }
}

/// Removes duplicate candidates, keeping first occurrences in order.
fn dedup_candidates(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|candidate| seen.insert(candidate.dedup_key()))
        .collect()
}
