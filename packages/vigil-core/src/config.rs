//! Per-channel capture configuration.
//!
//! A [`ChannelConfig`] describes one sensor source (camera or microphone) and
//! the recovery policy of its capture pipeline. All fields carry defaults
//! appropriate to the channel kind; only the input identity is mandatory.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capture::ladder::CandidateSpec;

/// Default audio sample rate in Hz.
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;
/// Default audio channel count.
pub const DEFAULT_CHANNELS: u16 = 1;
/// Default audio frame duration in milliseconds.
pub const DEFAULT_FRAME_DURATION_MS: u32 = 100;
/// Default video frame sampling rate for the PNG pipeline.
pub const DEFAULT_VIDEO_FPS: u32 = 5;
/// Default startup window: a unit must arrive within this time.
pub const DEFAULT_START_TIMEOUT_MS: u64 = 4_000;
/// Default idle window: bytes must keep arriving within this time.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 5_000;
/// Default ceiling on graceful child termination.
pub const DEFAULT_FORCE_KILL_TIMEOUT_MS: u64 = 3_000;
/// Default normalised RMS threshold below which audio counts as silent.
pub const DEFAULT_SILENCE_THRESHOLD: f64 = 0.0025;
/// Default cumulative silence needed to trip a silence recovery.
pub const DEFAULT_SILENCE_DURATION_MS: u64 = 2_000;
/// Default number of circuit-counting failures before the breaker latches.
pub const DEFAULT_CIRCUIT_BREAKER_THRESHOLD: u32 = 4;
/// Default audio device discovery probe timeout (0 disables the probe).
pub const DEFAULT_DEVICE_DISCOVERY_TIMEOUT_MS: u64 = 2_000;
/// Default cap on the video reassembly buffer.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 5 * 1024 * 1024;

/// The sensor modality of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Audio,
    Video,
}

impl ChannelKind {
    /// Returns the kind as a short string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Injectable uniform randomness in `[0, 1)` for backoff jitter.
///
/// The backoff calculator never reaches for a global RNG; tests inject a
/// fixed source to make every computed delay deterministic.
#[derive(Clone)]
pub struct RandomSource(Arc<dyn Fn() -> f64 + Send + Sync>);

impl RandomSource {
    /// Wraps an arbitrary sampling function.
    pub fn new(sample: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        Self(Arc::new(sample))
    }

    /// A source that always returns the same value. Test helper.
    #[must_use]
    pub fn fixed(value: f64) -> Self {
        Self::new(move || value)
    }

    /// Draws one sample in `[0, 1)`.
    #[must_use]
    pub fn sample(&self) -> f64 {
        (self.0)()
    }
}

impl Default for RandomSource {
    fn default() -> Self {
        Self::new(rand::random::<f64>)
    }
}

impl fmt::Debug for RandomSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RandomSource(..)")
    }
}

/// Configuration for one capture channel.
///
/// Construct with [`ChannelConfig::audio`] or [`ChannelConfig::video`] to get
/// kind-appropriate defaults, then adjust fields as needed and validate.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Opaque channel identity used in events, logs and metrics.
    pub id: String,
    pub kind: ChannelKind,
    /// Input identity: a URI, `pipe:0`, or `mic` for device capture.
    pub input: String,
    /// Audio: explicit capture device selection.
    pub device: Option<String>,
    /// Audio: explicit input format (e.g. `alsa`, `avfoundation`).
    pub input_format: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration_ms: u32,
    /// Video: frame sampling rate of the PNG pipeline.
    pub fps: u32,
    pub start_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    /// Defaults to `idle_timeout_ms` when unset.
    pub watchdog_timeout_ms: Option<u64>,
    pub force_kill_timeout_ms: u64,
    pub restart_delay_ms: u64,
    pub restart_max_delay_ms: u64,
    pub restart_jitter_factor: f64,
    pub silence_threshold: f64,
    pub silence_duration_ms: u64,
    pub circuit_breaker_threshold: u32,
    /// Audio: device discovery probe timeout; 0 disables the probe.
    pub device_discovery_timeout_ms: u64,
    /// Video: cap on the PNG reassembly buffer.
    pub max_buffer_bytes: usize,
    /// Video: transport hint for network streams (e.g. `tcp` for RTSP).
    pub transport: Option<String>,
    /// Operator overrides for the microphone fallback ladder, keyed by OS
    /// tag (`linux`, `macos`, `windows`) or `*` for any platform.
    pub mic_fallbacks: HashMap<String, Vec<CandidateSpec>>,
    /// Optional bundled transcoder path tried before well-known names.
    pub binary_path: Option<PathBuf>,
    /// Randomness source for backoff jitter.
    pub random: RandomSource,
}

impl ChannelConfig {
    /// Creates an audio channel configuration with audio defaults.
    #[must_use]
    pub fn audio(id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ChannelKind::Audio,
            input: input.into(),
            device: None,
            input_format: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            frame_duration_ms: DEFAULT_FRAME_DURATION_MS,
            fps: DEFAULT_VIDEO_FPS,
            start_timeout_ms: DEFAULT_START_TIMEOUT_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            watchdog_timeout_ms: None,
            force_kill_timeout_ms: DEFAULT_FORCE_KILL_TIMEOUT_MS,
            restart_delay_ms: 3_000,
            restart_max_delay_ms: 6_000,
            restart_jitter_factor: 0.25,
            silence_threshold: DEFAULT_SILENCE_THRESHOLD,
            silence_duration_ms: DEFAULT_SILENCE_DURATION_MS,
            circuit_breaker_threshold: DEFAULT_CIRCUIT_BREAKER_THRESHOLD,
            device_discovery_timeout_ms: DEFAULT_DEVICE_DISCOVERY_TIMEOUT_MS,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            transport: None,
            mic_fallbacks: HashMap::new(),
            binary_path: None,
            random: RandomSource::default(),
        }
    }

    /// Creates a video channel configuration with video defaults.
    #[must_use]
    pub fn video(id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            kind: ChannelKind::Video,
            restart_delay_ms: 500,
            restart_max_delay_ms: 5_000,
            restart_jitter_factor: 0.2,
            // Video channels never run the microphone probe.
            device_discovery_timeout_ms: 0,
            ..Self::audio(id, input)
        }
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns a message describing the first value that would cause runtime
    /// issues.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("channel id must not be empty".to_string());
        }
        if self.input.is_empty() {
            return Err("input identity must not be empty".to_string());
        }
        if self.sample_rate == 0 {
            return Err("sample_rate must be >= 1".to_string());
        }
        if self.channels == 0 {
            return Err("channels must be >= 1".to_string());
        }
        if self.frame_duration_ms == 0 {
            return Err("frame_duration_ms must be >= 1".to_string());
        }
        if self.kind == ChannelKind::Video && self.fps == 0 {
            return Err("fps must be >= 1 for video channels".to_string());
        }
        if self.restart_delay_ms == 0 {
            return Err("restart_delay_ms must be >= 1".to_string());
        }
        if self.restart_max_delay_ms < self.restart_delay_ms {
            return Err("restart_max_delay_ms must be >= restart_delay_ms".to_string());
        }
        if !(0.0..=1.0).contains(&self.restart_jitter_factor) {
            return Err("restart_jitter_factor must be within [0, 1]".to_string());
        }
        if self.force_kill_timeout_ms == 0 {
            return Err("force_kill_timeout_ms must be >= 1".to_string());
        }
        if self.circuit_breaker_threshold == 0 {
            return Err("circuit_breaker_threshold must be >= 1".to_string());
        }
        if self.max_buffer_bytes == 0 {
            return Err("max_buffer_bytes must be >= 1".to_string());
        }
        Ok(())
    }

    /// The watchdog window, falling back to the idle window when unset.
    #[must_use]
    pub fn effective_watchdog_timeout_ms(&self) -> u64 {
        self.watchdog_timeout_ms.unwrap_or(self.idle_timeout_ms)
    }

    /// Size in bytes of one audio unit (16-bit samples).
    #[must_use]
    pub fn audio_unit_bytes(&self) -> usize {
        let samples = (u64::from(self.frame_duration_ms) * u64::from(self.sample_rate)) / 1_000;
        samples as usize * usize::from(self.channels) * 2
    }

    /// Whether the input is a pipe source (`pipe:N`).
    #[must_use]
    pub fn is_pipe_input(&self) -> bool {
        self.input.starts_with("pipe:")
    }

    /// Whether the input selects local microphone capture.
    #[must_use]
    pub fn is_mic_input(&self) -> bool {
        self.input == "mic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_defaults_match_contract() {
        let config = ChannelConfig::audio("front-door", "mic");
        assert_eq!(config.sample_rate, 16_000);
        assert_eq!(config.channels, 1);
        assert_eq!(config.frame_duration_ms, 100);
        assert_eq!(config.restart_delay_ms, 3_000);
        assert_eq!(config.restart_max_delay_ms, 6_000);
        assert_eq!(config.restart_jitter_factor, 0.25);
        assert_eq!(config.silence_duration_ms, 2_000);
        assert_eq!(config.circuit_breaker_threshold, 4);
        assert_eq!(config.device_discovery_timeout_ms, 2_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn video_defaults_match_contract() {
        let config = ChannelConfig::video("lobby", "rtsp://cam.local/stream");
        assert_eq!(config.restart_delay_ms, 500);
        assert_eq!(config.restart_max_delay_ms, 5_000);
        assert_eq!(config.restart_jitter_factor, 0.2);
        assert_eq!(config.device_discovery_timeout_ms, 0);
        assert_eq!(config.max_buffer_bytes, 5 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn watchdog_defaults_to_idle_timeout() {
        let mut config = ChannelConfig::audio("a", "mic");
        assert_eq!(config.effective_watchdog_timeout_ms(), 5_000);
        config.watchdog_timeout_ms = Some(30_000);
        assert_eq!(config.effective_watchdog_timeout_ms(), 30_000);
    }

    #[test]
    fn audio_unit_bytes_uses_sixteen_bit_samples() {
        let config = ChannelConfig::audio("a", "mic");
        // 100ms at 16kHz mono = 1600 samples = 3200 bytes.
        assert_eq!(config.audio_unit_bytes(), 3_200);

        let mut stereo = config.clone();
        stereo.channels = 2;
        assert_eq!(stereo.audio_unit_bytes(), 6_400);
    }

    #[test]
    fn input_classification() {
        assert!(ChannelConfig::audio("a", "pipe:0").is_pipe_input());
        assert!(ChannelConfig::audio("a", "mic").is_mic_input());
        assert!(!ChannelConfig::audio("a", "rtsp://x").is_pipe_input());
    }

    #[test]
    fn validate_rejects_inverted_delay_bounds() {
        let mut config = ChannelConfig::audio("a", "mic");
        config.restart_max_delay_ms = config.restart_delay_ms - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_jitter() {
        let mut config = ChannelConfig::audio("a", "mic");
        config.restart_jitter_factor = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn fixed_random_source_is_deterministic() {
        let random = RandomSource::fixed(0.25);
        assert_eq!(random.sample(), 0.25);
        assert_eq!(random.sample(), 0.25);
    }
}
