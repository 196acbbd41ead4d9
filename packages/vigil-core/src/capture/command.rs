//! Transcoder invocation contract.
//!
//! Argument composition is bit-exact: the candidate's input arguments are
//! followed by a fixed per-kind output tail, so two runtimes driving the same
//! configuration spawn byte-identical command lines.

use std::path::Path;

use crate::config::{ChannelConfig, ChannelKind};

use super::ladder::Candidate;

/// Well-known transcoder binary name.
pub const STANDARD_BINARY: &str = "ffmpeg";
/// Legacy-compatible transcoder binary name.
pub const LEGACY_BINARY: &str = "avconv";

/// One fully composed child process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub binary: String,
    pub args: Vec<String>,
    /// Whether the child gets a piped stdin (pipe inputs only).
    pub pipe_stdin: bool,
}

impl CommandSpec {
    /// Renders the invocation as a single log-friendly line.
    #[must_use]
    pub fn display_line(&self) -> String {
        let mut line = self.binary.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Ordered binary candidates: bundled path first, then well-known names.
#[must_use]
pub fn binary_list(bundled: Option<&Path>) -> Vec<String> {
    let mut binaries = Vec::with_capacity(3);
    if let Some(path) = bundled {
        binaries.push(path.to_string_lossy().into_owned());
    }
    binaries.push(STANDARD_BINARY.to_string());
    binaries.push(LEGACY_BINARY.to_string());
    binaries
}

/// Output tail for audio channels: raw signed 16-bit LE PCM on stdout.
#[must_use]
pub fn audio_output_args(channels: u16, sample_rate: u32) -> Vec<String> {
    vec![
        "-ac".to_string(),
        channels.to_string(),
        "-ar".to_string(),
        sample_rate.to_string(),
        "-f".to_string(),
        "s16le".to_string(),
        "-acodec".to_string(),
        "pcm_s16le".to_string(),
        "pipe:1".to_string(),
    ]
}

/// Output tail for video channels: sampled PNG frames on stdout.
#[must_use]
pub fn video_output_args(fps: u32) -> Vec<String> {
    vec![
        "-vf".to_string(),
        format!("fps={fps}"),
        "-f".to_string(),
        "image2pipe".to_string(),
        "-vcodec".to_string(),
        "png".to_string(),
        "pipe:1".to_string(),
    ]
}

/// Composes the full invocation for one (binary, candidate) pair.
#[must_use]
pub fn build_spec(binary: &str, candidate: &Candidate, config: &ChannelConfig) -> CommandSpec {
    let mut args = candidate.input_args.clone();
    match config.kind {
        ChannelKind::Audio => args.extend(audio_output_args(config.channels, config.sample_rate)),
        ChannelKind::Video => args.extend(video_output_args(config.fps)),
    }
    CommandSpec {
        binary: binary.to_string(),
        args,
        pipe_stdin: config.is_pipe_input(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_list_orders_bundled_first() {
        let binaries = binary_list(Some(Path::new("/opt/vigil/bin/ffmpeg")));
        assert_eq!(binaries, ["/opt/vigil/bin/ffmpeg", "ffmpeg", "avconv"]);

        assert_eq!(binary_list(None), ["ffmpeg", "avconv"]);
    }

    #[test]
    fn audio_tail_is_bit_exact() {
        assert_eq!(
            audio_output_args(1, 16_000),
            ["-ac", "1", "-ar", "16000", "-f", "s16le", "-acodec", "pcm_s16le", "pipe:1"]
        );
    }

    #[test]
    fn video_tail_is_bit_exact() {
        assert_eq!(
            video_output_args(5),
            ["-vf", "fps=5", "-f", "image2pipe", "-vcodec", "png", "pipe:1"]
        );
    }

    #[test]
    fn spec_appends_tail_after_candidate_args() {
        let config = ChannelConfig::audio("mic-0", "mic");
        let candidate = Candidate::for_device("alsa", "default");
        let spec = build_spec("ffmpeg", &candidate, &config);
        assert_eq!(
            spec.args,
            [
                "-f", "alsa", "-i", "default", "-ac", "1", "-ar", "16000", "-f", "s16le",
                "-acodec", "pcm_s16le", "pipe:1"
            ]
        );
        assert!(!spec.pipe_stdin);
    }

    #[test]
    fn pipe_inputs_request_a_piped_stdin() {
        let config = ChannelConfig::audio("mic-0", "pipe:0");
        let candidate = Candidate {
            input_format: None,
            device: None,
            input_args: vec!["-i".to_string(), "pipe:0".to_string()],
        };
        let spec = build_spec("ffmpeg", &candidate, &config);
        assert!(spec.pipe_stdin);
    }

    #[test]
    fn display_line_joins_arguments() {
        let spec = CommandSpec {
            binary: "ffmpeg".to_string(),
            args: vec!["-i".to_string(), "default".to_string()],
            pipe_stdin: false,
        };
        assert_eq!(spec.display_line(), "ffmpeg -i default");
    }
}
