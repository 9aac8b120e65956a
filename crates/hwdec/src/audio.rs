//! Audio output assembly: codec output buffers to PCM blocks.

use tracing::{debug, trace};

use crate::backend::OutputBuffer;
use crate::codec::CodecHandle;
use crate::error::DecodeError;
use crate::manager::OutputAssembler;
use crate::sample::{AudioFormat, DecodedPayload, DecodedUnit, PcmBlock, TrackKind};

/// Turns 16-bit interleaved PCM output buffers into [`PcmBlock`] units.
/// Tracks the codec's reported channel count and sample rate so a mid-stream
/// format change re-times everything that follows.
pub struct AudioOutputAssembler {
    format: AudioFormat,
}

impl AudioOutputAssembler {
    pub fn new(format: AudioFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }
}

impl OutputAssembler for AudioOutputAssembler {
    fn track_kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn refresh_format(&mut self, codec: &CodecHandle) -> Result<(), DecodeError> {
        let reported = codec.output_format()?;
        if let Some(format) = reported.audio {
            if format.channels == 0 || format.sample_rate == 0 {
                return Err(DecodeError::Fatal(format!(
                    "codec reported unusable audio format: {} ch @ {} Hz",
                    format.channels, format.sample_rate
                )));
            }
            if format != self.format {
                debug!(
                    channels = format.channels,
                    sample_rate = format.sample_rate,
                    "audio output format changed"
                );
            }
            self.format = format;
        }
        Ok(())
    }

    fn assemble(
        &mut self,
        codec: &CodecHandle,
        buffer: &OutputBuffer,
        stream_offset: i64,
    ) -> Result<Vec<DecodedUnit>, DecodeError> {
        // Codecs occasionally emit zero-length buffers; skip them.
        if buffer.size == 0 {
            return Ok(Vec::new());
        }
        let data = codec.output_data(buffer.slot)?;
        let window = data
            .get(buffer.offset..buffer.offset + buffer.size)
            .ok_or_else(|| {
                DecodeError::Fatal(format!(
                    "audio output window {}+{} exceeds buffer of {} bytes",
                    buffer.offset,
                    buffer.size,
                    data.len()
                ))
            })?;

        let frames = window.len() / self.format.bytes_per_frame();
        if frames == 0 {
            return Ok(Vec::new());
        }
        trace!(frames, time_us = buffer.time_us, "audio output assembled");
        let block = PcmBlock {
            data: data.slice(buffer.offset..buffer.offset + buffer.size),
            channels: self.format.channels,
            sample_rate: self.format.sample_rate,
            frames: frames as u64,
        };
        Ok(vec![DecodedUnit {
            payload: DecodedPayload::Pcm(block),
            time_us: buffer.time_us,
            duration_us: self.format.frames_to_us(frames as u64),
            offset: stream_offset,
        }])
    }

    fn on_flush(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CodecBackend, CodecConfig, MockCodec};
    use std::time::Duration;

    fn stereo() -> AudioFormat {
        AudioFormat {
            channels: 2,
            sample_rate: 48_000,
        }
    }

    fn running_handle() -> (CodecHandle, crate::backend::MockProbe) {
        let (codec, probe) = MockCodec::audio(stereo());
        let handle = CodecHandle::new();
        handle.install(Box::new(codec)).unwrap();
        handle
            .configure(&CodecConfig::audio("audio/mp4a-latm", stereo()))
            .unwrap();
        handle.start().unwrap();
        (handle, probe)
    }

    #[test]
    fn pcm_block_timing_matches_frame_count() {
        let (handle, _probe) = running_handle();
        let mut assembler = AudioOutputAssembler::new(stereo());
        assembler.refresh_format(&handle).unwrap();

        // 480 frames of stereo 16-bit PCM = 1920 bytes = 10 ms at 48 kHz.
        handle
            .submit(&vec![0u8; 1920], 5_000, 0, Duration::ZERO)
            .unwrap();
        let out = handle.dequeue_output(Duration::ZERO).unwrap();
        let units = assembler.assemble(&handle, &out, 512).unwrap();
        handle.release_output(out.slot).unwrap();

        assert_eq!(units.len(), 1);
        let unit = &units[0];
        assert_eq!(unit.time_us, 5_000);
        assert_eq!(unit.duration_us, 10_000);
        assert_eq!(unit.offset, 512);
        match &unit.payload {
            DecodedPayload::Pcm(block) => {
                assert_eq!(block.frames, 480u64);
                assert_eq!(block.channels, 2);
                assert_eq!(block.sample_rate, 48_000);
            }
            other => panic!("expected pcm, got {other:?}"),
        }
    }

    #[test]
    fn empty_buffer_yields_nothing() {
        let (handle, _probe) = running_handle();
        let mut assembler = AudioOutputAssembler::new(stereo());

        handle.submit(&[], 0, 0, Duration::ZERO).unwrap();
        let out = handle.dequeue_output(Duration::ZERO).unwrap();
        assert!(assembler.assemble(&handle, &out, 0).unwrap().is_empty());
        handle.release_output(out.slot).unwrap();
    }

    #[test]
    fn format_refresh_adopts_codec_report() {
        let (handle, probe) = running_handle();
        let mut assembler = AudioOutputAssembler::new(stereo());
        probe.change_audio_format(AudioFormat {
            channels: 1,
            sample_rate: 16_000,
        });
        assembler.refresh_format(&handle).unwrap();
        assert_eq!(assembler.format().channels, 1);
        assert_eq!(assembler.format().sample_rate, 16_000);
    }
}
