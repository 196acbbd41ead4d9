//! Per-frame acoustic health evaluation.
//!
//! A microphone that keeps delivering bytes can still be dead: ALSA happily
//! serves an unplugged device as a stream of zeros. The monitor computes RMS
//! and peak over every emitted unit and trips a silence recovery when the
//! channel stays flat for the configured window. A latch keeps the trip from
//! re-firing until the next attach.

use crate::config::ChannelConfig;

/// Outcome of evaluating one audio unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilenceVerdict {
    /// Audible signal present; accumulator and latch were reset.
    Active,
    /// Silent, but the trip window has not elapsed (or already tripped).
    Silent,
    /// The cumulative silence window just elapsed; recover the stream.
    Tripped,
}

/// Sliding silence detector over consecutive audio units.
#[derive(Debug)]
pub struct SilenceMonitor {
    threshold: f64,
    trip_after_ms: u64,
    frame_duration_ms: u64,
    silent_ms: u64,
    latched: bool,
}

impl SilenceMonitor {
    /// Creates a monitor with an explicit geometry.
    #[must_use]
    pub fn new(threshold: f64, trip_after_ms: u64, frame_duration_ms: u64) -> Self {
        Self {
            threshold,
            trip_after_ms,
            frame_duration_ms,
            silent_ms: 0,
            latched: false,
        }
    }

    /// Creates a monitor from a channel's silence configuration.
    #[must_use]
    pub fn for_channel(config: &ChannelConfig) -> Self {
        Self::new(
            config.silence_threshold,
            config.silence_duration_ms,
            u64::from(config.frame_duration_ms),
        )
    }

    /// Re-arms the monitor after a successful attach.
    pub fn rearm(&mut self) {
        self.silent_ms = 0;
        self.latched = false;
    }

    /// Evaluates one unit of signed 16-bit little-endian samples.
    pub fn observe(&mut self, unit: &[u8]) -> SilenceVerdict {
        let (rms, peak) = measure(unit);
        if rms <= self.threshold && peak <= self.threshold * 2.0 {
            self.silent_ms += self.frame_duration_ms;
            if !self.latched && self.silent_ms >= self.trip_after_ms {
                self.latched = true;
                return SilenceVerdict::Tripped;
            }
            SilenceVerdict::Silent
        } else {
            self.silent_ms = 0;
            self.latched = false;
            SilenceVerdict::Active
        }
    }
}

/// Computes (rms, peak) over i16 LE samples, normalised to `[0, 1]`.
#[must_use]
pub fn measure(unit: &[u8]) -> (f64, f64) {
    let mut sum_squares = 0.0f64;
    let mut peak = 0.0f64;
    let mut count = 0usize;
    for pair in unit.chunks_exact(2) {
        let sample = f64::from(i16::from_le_bytes([pair[0], pair[1]])) / 32_768.0;
        sum_squares += sample * sample;
        peak = peak.max(sample.abs());
        count += 1;
    }
    if count == 0 {
        return (0.0, 0.0);
    }
    ((sum_squares / count as f64).sqrt(), peak)
}
