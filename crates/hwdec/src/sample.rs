//! Data model shared across the pipeline.
//!
//! Encoded input travels as [`Sample`]; decoded output as [`DecodedUnit`].
//! An empty payload marks end-of-stream, which keeps the input queue
//! homogeneous instead of carrying a separate sentinel type.

use bytes::Bytes;

/// The media type handled by one pipeline instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

/// One encoded input unit.
///
/// Owned by the caller until accepted into the input queue, then by the
/// decoder manager until the codec consumes it.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Encoded payload. Empty means end-of-stream.
    pub payload: Bytes,
    /// Presentation timestamp in microseconds.
    pub time_us: i64,
    /// Byte offset of this sample in the source stream, used to correlate
    /// outputs back to inputs.
    pub offset: i64,
}

impl Sample {
    pub fn new(payload: Bytes, time_us: i64, offset: i64) -> Self {
        Self {
            payload,
            time_us,
            offset,
        }
    }

    /// The end-of-stream marker sample.
    pub fn eos() -> Self {
        Self {
            payload: Bytes::new(),
            time_us: 0,
            offset: -1,
        }
    }

    pub fn is_eos(&self) -> bool {
        self.payload.is_empty()
    }
}

/// PCM output format, re-queried from the codec whenever it reports a
/// format change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub channels: u32,
    pub sample_rate: u32,
}

impl AudioFormat {
    /// Bytes per PCM frame (16-bit samples, interleaved).
    pub fn bytes_per_frame(&self) -> usize {
        2 * self.channels as usize
    }

    /// Converts a frame count to a duration in microseconds.
    pub fn frames_to_us(&self, frames: u64) -> i64 {
        (frames as i64 * 1_000_000) / self.sample_rate.max(1) as i64
    }
}

/// Crop rectangle reported by the video codec, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CropRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

/// Decoded frame layout reported by the video codec.
///
/// Tracked by the video assembler independently of the pipeline state
/// machine and recomputed on every format change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: i32,
    pub height: i32,
    /// Row stride in bytes; may exceed `width`.
    pub stride: i32,
    /// Plane height in rows; may exceed `height`.
    pub slice_height: i32,
    pub crop: CropRect,
}

impl FrameGeometry {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            width,
            height,
            stride: width,
            slice_height: height,
            crop: CropRect {
                left: 0,
                top: 0,
                right: width - 1,
                bottom: height - 1,
            },
        }
    }

    /// Visible width after cropping.
    pub fn display_width(&self) -> i32 {
        self.crop.right - self.crop.left + 1
    }

    /// Visible height after cropping.
    pub fn display_height(&self) -> i32 {
        self.crop.bottom - self.crop.top + 1
    }
}

/// Opaque handle to a hardware-owned decoded image, used when the output
/// buffer is graphics-memory-backed rather than raw pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHandle(pub u64);

/// A block of interleaved 16-bit PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBlock {
    pub data: Bytes,
    pub channels: u32,
    pub sample_rate: u32,
    pub frames: u64,
}

/// Pixel storage for one decoded video frame.
#[derive(Debug, Clone, PartialEq)]
pub enum VideoPixels {
    /// Pixels deep-copied out of hardware memory.
    Owned(Bytes),
    /// Hardware-owned image; valid until the codec instance is flushed or
    /// released.
    Image(ImageHandle),
}

/// One decoded video frame together with the geometry it was produced under.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrameUnit {
    pub pixels: VideoPixels,
    pub geometry: FrameGeometry,
}

/// Media-specific payload of a decoded unit.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedPayload {
    Pcm(PcmBlock),
    Frame(VideoFrameUnit),
}

/// One decoded output unit, delivered through `decode()`/`drain()` futures
/// in ascending timestamp order.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedUnit {
    pub payload: DecodedPayload,
    /// Presentation timestamp in microseconds.
    pub time_us: i64,
    /// Duration in microseconds.
    pub duration_us: i64,
    /// Byte offset of the originating sample in the source stream, carried
    /// over from the matching wait-list entry; -1 when no entry matched.
    pub offset: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eos_is_empty_payload() {
        assert!(Sample::eos().is_eos());
        assert!(!Sample::new(Bytes::from_static(b"\x00"), 0, 0).is_eos());
    }

    #[test]
    fn audio_frame_math() {
        let fmt = AudioFormat {
            channels: 2,
            sample_rate: 48_000,
        };
        assert_eq!(fmt.bytes_per_frame(), 4);
        // 48000 frames at 48 kHz is exactly one second.
        assert_eq!(fmt.frames_to_us(48_000), 1_000_000);
    }

    #[test]
    fn geometry_display_size_honors_crop() {
        let mut geom = FrameGeometry::new(1920, 1088);
        geom.crop.bottom = 1079;
        assert_eq!(geom.display_width(), 1920);
        assert_eq!(geom.display_height(), 1080);
    }
}
