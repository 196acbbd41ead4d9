//! Byte-stream reassembly into complete sensor units.
//!
//! The transcoder child emits an unframed byte stream on stdout; these
//! assemblers cut it into discrete units: fixed-size PCM frames for audio,
//! complete PNG images for video. Neither ever yields a partial unit, and
//! output preserves the byte order of the input.

use bytes::{Bytes, BytesMut};

use crate::config::{ChannelConfig, ChannelKind};
use crate::error::FrameError;

/// The 8-byte PNG file signature.
pub const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// Reassembles raw PCM bytes into fixed-duration audio frames.
///
/// Unit size is `frame_duration_ms x sample_rate x channels x 2` bytes
/// (signed 16-bit little-endian samples). In aligned pipe mode every incoming
/// chunk must be a whole multiple of the sample frame (`channels x 2` bytes);
/// a misaligned chunk indicates an upstream re-sync bug and clears the buffer.
#[derive(Debug)]
pub struct PcmFrameAssembler {
    unit_bytes: usize,
    alignment: Option<usize>,
    buf: BytesMut,
}

impl PcmFrameAssembler {
    /// Creates an assembler for the given audio geometry.
    #[must_use]
    pub fn new(sample_rate: u32, channels: u16, frame_duration_ms: u32, aligned_pipe: bool) -> Self {
        let samples = (u64::from(frame_duration_ms) * u64::from(sample_rate)) / 1_000;
        let unit_bytes = samples as usize * usize::from(channels) * 2;
        Self {
            unit_bytes,
            alignment: aligned_pipe.then(|| usize::from(channels) * 2),
            buf: BytesMut::new(),
        }
    }

    /// Size in bytes of one emitted unit.
    #[must_use]
    pub fn unit_bytes(&self) -> usize {
        self.unit_bytes
    }

    /// Bytes currently buffered without forming a unit.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Discards any buffered partial unit.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Consumes one chunk and returns every complete unit it yields.
    ///
    /// # Errors
    ///
    /// In aligned pipe mode, a chunk that is not a whole multiple of the
    /// sample frame returns [`FrameError::Misaligned`] and discards the
    /// buffer.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, FrameError> {
        if let Some(align) = self.alignment {
            if chunk.len() % align != 0 {
                self.buf.clear();
                return Err(FrameError::Misaligned {
                    len: chunk.len(),
                    align,
                });
            }
        }
        self.buf.extend_from_slice(chunk);
        let mut units = Vec::new();
        while self.buf.len() >= self.unit_bytes {
            units.push(self.buf.split_to(self.unit_bytes).freeze());
        }
        Ok(units)
    }
}

/// Reassembles a byte stream into complete PNG images.
///
/// Garbage before the PNG signature is discarded; from the signature the
/// chunk structure (`length || type || data || crc`) is walked until `IEND`.
/// If the buffer outgrows its cap without yielding an image the stream is
/// considered corrupt and the buffer is cleared.
#[derive(Debug)]
pub struct PngFrameAssembler {
    max_buffer_bytes: usize,
    buf: BytesMut,
}

impl PngFrameAssembler {
    /// Creates an assembler with the given buffer cap.
    #[must_use]
    pub fn new(max_buffer_bytes: usize) -> Self {
        Self {
            max_buffer_bytes,
            buf: BytesMut::new(),
        }
    }

    /// Bytes currently buffered without forming a unit.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Discards any buffered partial image.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Consumes one chunk and returns every complete PNG it yields.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::BufferOverflow`] and clears the buffer when it
    /// grows past the cap without producing an image.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, FrameError> {
        self.buf.extend_from_slice(chunk);
        let mut units = Vec::new();
        while let Some(unit) = self.try_extract() {
            units.push(unit);
        }
        if units.is_empty() && self.buf.len() > self.max_buffer_bytes {
            self.buf.clear();
            return Err(FrameError::BufferOverflow {
                cap: self.max_buffer_bytes,
            });
        }
        Ok(units)
    }

    /// Attempts to cut one complete PNG off the front of the buffer.
    fn try_extract(&mut self) -> Option<Bytes> {
        let start = find_signature(&self.buf)?;
        if start > 0 {
            // Garbage before the signature never forms an image.
            let _ = self.buf.split_to(start);
        }

        let mut pos = PNG_SIGNATURE.len();
        loop {
            // Each chunk needs at least its 8-byte header in the buffer.
            if self.buf.len() < pos + 8 {
                return None;
            }
            let length = u32::from_be_bytes([
                self.buf[pos],
                self.buf[pos + 1],
                self.buf[pos + 2],
                self.buf[pos + 3],
            ]) as usize;
            let chunk_type = &self.buf[pos + 4..pos + 8];
            let is_end = chunk_type == b"IEND";
            // header + data + crc; checked so a bogus length field cannot
            // wrap and turn into a bogus slice.
            let end = pos.checked_add(8)?.checked_add(length)?.checked_add(4)?;
            if self.buf.len() < end {
                return None;
            }
            pos = end;
            if is_end {
                return Some(self.buf.split_to(pos).freeze());
            }
        }
    }
}

fn find_signature(buf: &[u8]) -> Option<usize> {
    if buf.len() < PNG_SIGNATURE.len() {
        return None;
    }
    buf.windows(PNG_SIGNATURE.len())
        .position(|window| window == &PNG_SIGNATURE[..])
}

/// Kind-dispatched unit assembler for one channel.
#[derive(Debug)]
pub enum UnitAssembler {
    Pcm(PcmFrameAssembler),
    Png(PngFrameAssembler),
}

impl UnitAssembler {
    /// Builds the assembler matching the channel's kind and geometry.
    #[must_use]
    pub fn for_channel(config: &ChannelConfig) -> Self {
        match config.kind {
            ChannelKind::Audio => Self::Pcm(PcmFrameAssembler::new(
                config.sample_rate,
                config.channels,
                config.frame_duration_ms,
                config.is_pipe_input(),
            )),
            ChannelKind::Video => Self::Png(PngFrameAssembler::new(config.max_buffer_bytes)),
        }
    }

    /// Consumes one chunk and returns every complete unit it yields.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, FrameError> {
        match self {
            Self::Pcm(inner) => inner.push(chunk),
            Self::Png(inner) => inner.push(chunk),
        }
    }

    /// Discards any buffered partial unit.
    pub fn clear(&mut self) {
        match self {
            Self::Pcm(inner) => inner.clear(),
            Self::Png(inner) => inner.clear(),
        }
    }
}
