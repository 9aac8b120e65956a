//! Video output assembly: codec output buffers to frames.

use tracing::{debug, trace};

use crate::backend::OutputBuffer;
use crate::codec::CodecHandle;
use crate::error::DecodeError;
use crate::manager::OutputAssembler;
use crate::sample::{
    DecodedPayload, DecodedUnit, FrameGeometry, TrackKind, VideoFrameUnit, VideoPixels,
};

/// Turns codec output buffers into [`VideoFrameUnit`]s.
///
/// Frames normally carry the hardware image handle so presentation can
/// composite zero-copy. Around a flush the hardware may recycle those
/// surfaces under the presenter's feet, so frames produced after a flush
/// are deep-copied until the codec reports a fresh output configuration.
pub struct VideoOutputAssembler {
    geometry: FrameGeometry,
    frame_duration_us: i64,
    copy_requested: bool,
}

impl VideoOutputAssembler {
    pub fn new(geometry: FrameGeometry, frame_duration_us: i64) -> Self {
        Self {
            geometry,
            frame_duration_us,
            copy_requested: false,
        }
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    #[cfg(test)]
    pub(crate) fn copy_requested(&self) -> bool {
        self.copy_requested
    }
}

impl OutputAssembler for VideoOutputAssembler {
    fn track_kind(&self) -> TrackKind {
        TrackKind::Video
    }

    fn refresh_format(&mut self, codec: &CodecHandle) -> Result<(), DecodeError> {
        let reported = codec.output_format()?;
        if let Some(geometry) = reported.geometry {
            if geometry.width <= 0 || geometry.height <= 0 {
                return Err(DecodeError::Fatal(format!(
                    "codec reported unusable geometry: {}x{}",
                    geometry.width, geometry.height
                )));
            }
            if geometry != self.geometry {
                debug!(
                    width = geometry.width,
                    height = geometry.height,
                    "video output geometry changed"
                );
            }
            self.geometry = geometry;
        }
        // The codec has reconfigured its output pool; handles are safe to
        // share again.
        self.copy_requested = false;
        Ok(())
    }

    fn assemble(
        &mut self,
        codec: &CodecHandle,
        buffer: &OutputBuffer,
        stream_offset: i64,
    ) -> Result<Vec<DecodedUnit>, DecodeError> {
        if buffer.size == 0 {
            return Ok(Vec::new());
        }
        let pixels = match codec.output_image(buffer.slot)? {
            Some(handle) if !self.copy_requested => VideoPixels::Image(handle),
            _ => {
                let data = codec.output_data(buffer.slot)?;
                let window = data
                    .get(buffer.offset..buffer.offset + buffer.size)
                    .ok_or_else(|| {
                        DecodeError::Fatal(format!(
                            "video output window {}+{} exceeds buffer of {} bytes",
                            buffer.offset,
                            buffer.size,
                            data.len()
                        ))
                    })?;
                VideoPixels::Owned(bytes::Bytes::copy_from_slice(window))
            }
        };
        trace!(time_us = buffer.time_us, "video frame assembled");
        Ok(vec![DecodedUnit {
            payload: DecodedPayload::Frame(VideoFrameUnit {
                pixels,
                geometry: self.geometry,
            }),
            time_us: buffer.time_us,
            duration_us: self.frame_duration_us,
            offset: stream_offset,
        }])
    }

    fn on_flush(&mut self) {
        self.copy_requested = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CodecBackend, CodecConfig, MockCodec, MockProbe};
    use std::time::Duration;

    fn geometry() -> FrameGeometry {
        FrameGeometry::new(320, 240)
    }

    fn running_handle(graphics: bool) -> (CodecHandle, MockProbe) {
        let (codec, probe) = MockCodec::video(geometry());
        probe.set_graphics_backed(graphics);
        let handle = CodecHandle::new();
        handle.install(Box::new(codec)).unwrap();
        handle
            .configure(&CodecConfig::video("video/avc", geometry()))
            .unwrap();
        handle.start().unwrap();
        (handle, probe)
    }

    fn one_frame(handle: &CodecHandle, assembler: &mut VideoOutputAssembler) -> DecodedUnit {
        handle
            .submit(&[1, 2, 3, 4], 40_000, 0, Duration::ZERO)
            .unwrap();
        let out = handle.dequeue_output(Duration::ZERO).unwrap();
        let mut units = assembler.assemble(handle, &out, 4_000).unwrap();
        handle.release_output(out.slot).unwrap();
        assert_eq!(units.len(), 1);
        units.remove(0)
    }

    #[test]
    fn graphics_buffers_pass_the_handle_through() {
        let (handle, _probe) = running_handle(true);
        let mut assembler = VideoOutputAssembler::new(geometry(), 33_333);

        let unit = one_frame(&handle, &mut assembler);
        assert_eq!(unit.time_us, 40_000);
        assert_eq!(unit.duration_us, 33_333);
        assert_eq!(unit.offset, 4_000);
        match unit.payload {
            DecodedPayload::Frame(frame) => {
                assert!(matches!(frame.pixels, VideoPixels::Image(_)));
                assert_eq!(frame.geometry, geometry());
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn software_buffers_are_copied() {
        let (handle, _probe) = running_handle(false);
        let mut assembler = VideoOutputAssembler::new(geometry(), 33_333);

        let unit = one_frame(&handle, &mut assembler);
        match unit.payload {
            DecodedPayload::Frame(frame) => match frame.pixels {
                VideoPixels::Owned(data) => assert_eq!(&data[..], &[1, 2, 3, 4]),
                other => panic!("expected owned pixels, got {other:?}"),
            },
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn flush_forces_copies_until_reconfiguration() {
        let (handle, probe) = running_handle(true);
        let mut assembler = VideoOutputAssembler::new(geometry(), 33_333);

        assembler.on_flush();
        assert!(assembler.copy_requested());
        let unit = one_frame(&handle, &mut assembler);
        match unit.payload {
            DecodedPayload::Frame(frame) => {
                assert!(matches!(frame.pixels, VideoPixels::Owned(_)))
            }
            other => panic!("expected frame, got {other:?}"),
        }

        // A format report clears the copy request.
        probe.change_geometry(FrameGeometry::new(640, 480));
        assert!(matches!(
            handle.dequeue_output(Duration::ZERO),
            Err(crate::error::CodecError::FormatChanged)
        ));
        assembler.refresh_format(&handle).unwrap();
        assert!(!assembler.copy_requested());
        assert_eq!(assembler.geometry().width, 640);
    }
}
