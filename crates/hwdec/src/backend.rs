//! The hardware codec boundary.
//!
//! [`CodecBackend`] is the only interface that must be reimplemented per
//! target platform: five lifecycle calls, the index-based buffer I/O calls,
//! and the activity-notification registration. Everything above it is
//! platform-agnostic.
//!
//! [`MockCodec`] is a scripted in-process backend used by the test suite and
//! for development on hosts without decode hardware, in the same spirit as a
//! placeholder decoder backend: same contract, no hardware.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{CodecError, CodecStatus};
use crate::sample::{AudioFormat, FrameGeometry, ImageHandle, TrackKind};
use crate::slots::{BufferSlot, SlotArena};

/// Input buffer flag: this buffer marks end of stream (payload is empty).
pub const FLAG_EOS: u32 = 1 << 0;
/// Input buffer flag: codec-specific configuration data, not a media sample.
pub const FLAG_CODEC_CONFIG: u32 = 1 << 1;

/// Static stream configuration handed to `configure()`.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    pub kind: TrackKind,
    /// Mime type of the encoded stream, e.g. `audio/mp4a-latm`, `video/avc`.
    pub mime: String,
    /// Initial PCM format, for audio streams.
    pub audio: Option<AudioFormat>,
    /// Initial frame geometry, for video streams.
    pub geometry: Option<FrameGeometry>,
    /// Codec-specific configuration blob submitted before the first sample.
    pub codec_specific: Option<Bytes>,
}

impl CodecConfig {
    pub fn audio(mime: impl Into<String>, format: AudioFormat) -> Self {
        Self {
            kind: TrackKind::Audio,
            mime: mime.into(),
            audio: Some(format),
            geometry: None,
            codec_specific: None,
        }
    }

    pub fn video(mime: impl Into<String>, geometry: FrameGeometry) -> Self {
        Self {
            kind: TrackKind::Video,
            mime: mime.into(),
            audio: None,
            geometry: Some(geometry),
            codec_specific: None,
        }
    }

    pub fn with_codec_specific(mut self, data: Bytes) -> Self {
        self.codec_specific = Some(data);
        self
    }
}

/// Metadata for one dequeued output buffer. The payload stays in the pool
/// and is read through [`CodecBackend::output_data`] by slot index.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    pub slot: BufferSlot,
    pub offset: usize,
    pub size: usize,
    pub time_us: i64,
    pub flags: u32,
}

impl OutputBuffer {
    pub fn is_eos(&self) -> bool {
        self.flags & FLAG_EOS != 0
    }
}

/// Current output format as reported by the codec.
#[derive(Debug, Clone, Copy)]
pub struct OutputFormat {
    pub audio: Option<AudioFormat>,
    pub geometry: Option<FrameGeometry>,
}

/// One-shot callback fired from the driver thread when the codec may make
/// progress again. Used instead of busy polling after `WouldBlock`.
pub type ActivityNotify = Box<dyn FnOnce() + Send>;

/// Platform hardware codec interface.
///
/// Lifecycle methods take `&mut self` and are serialized by the write lock
/// of the owning [`CodecHandle`](crate::codec::CodecHandle); buffer I/O
/// takes `&self` under the read lock, so implementations keep their I/O
/// state behind interior mutability (driver handles usually are already
/// thread-safe).
pub trait CodecBackend: Send + Sync {
    fn allocate(&mut self) -> CodecStatus<()>;
    fn configure(&mut self, config: &CodecConfig) -> CodecStatus<()>;
    fn start(&mut self) -> CodecStatus<()>;
    fn stop(&mut self) -> CodecStatus<()>;
    fn release(&mut self) -> CodecStatus<()>;
    /// Discards all queued input and pending output.
    fn flush(&mut self) -> CodecStatus<()>;

    /// Dequeues an empty input slot, waiting at most `timeout`.
    fn dequeue_input(&self, timeout: Duration) -> CodecStatus<BufferSlot>;
    /// Fills and submits an input slot. An empty payload with [`FLAG_EOS`]
    /// signals end of stream.
    fn enqueue_input(
        &self,
        slot: BufferSlot,
        payload: &[u8],
        time_us: i64,
        flags: u32,
    ) -> CodecStatus<()>;
    /// Dequeues the next decoded output, waiting at most `timeout`.
    fn dequeue_output(&self, timeout: Duration) -> CodecStatus<OutputBuffer>;
    /// Reads the payload of a dequeued output slot.
    fn output_data(&self, slot: BufferSlot) -> CodecStatus<Bytes>;
    /// Returns the hardware image handle backing a dequeued output slot, if
    /// the buffer is graphics-memory-backed.
    fn output_image(&self, slot: BufferSlot) -> CodecStatus<Option<ImageHandle>>;
    /// Returns a dequeued output slot to the pool. Must be called exactly
    /// once per successful `dequeue_output`.
    fn release_output(&self, slot: BufferSlot) -> CodecStatus<()>;
    fn output_format(&self) -> CodecStatus<OutputFormat>;
    /// Registers a one-shot progress callback, invoked from the driver
    /// thread once the codec is ready for further I/O.
    fn request_activity_notification(&self, notify: ActivityNotify);
}

// ============================================================================
// Scripted mock backend
// ============================================================================

/// A pending item in the mock's output pipeline.
enum Produced {
    /// Format-change event consumed by the next `dequeue_output`.
    FormatChange,
    /// A decoded buffer.
    Buffer { data: Bytes, time_us: i64, eos: bool },
}

struct MockState {
    allocated: bool,
    started: bool,
    input_slots: SlotArena,
    output_slots: SlotArena,
    /// Payloads of currently dequeued output slots, indexed by slot.
    slot_data: Vec<Bytes>,
    slot_eos: Vec<bool>,
    pending: VecDeque<Produced>,
    notify: Option<ActivityNotify>,
    /// Fire the armed notification even with no pending output (set by
    /// `MockProbe::unblock`).
    force_fire: bool,
    /// Remaining `dequeue_input` calls that report `WouldBlock`.
    blocked_inputs: usize,
    /// Scripted fatal error returned by the next `dequeue_output`.
    fatal: Option<String>,
    audio: Option<AudioFormat>,
    geometry: Option<FrameGeometry>,
    outputs_per_input: usize,
    /// Decoded bytes produced per output buffer (0 = echo the input payload).
    output_size: usize,
    graphics_backed: bool,
    next_image: u64,
    flush_count: u32,
    released: bool,
}

impl MockState {
    fn produce(&mut self, item: Produced) {
        self.pending.push_back(item);
    }

    /// Takes the armed notification if the codec can now make progress.
    fn ready_notify(&mut self) -> Option<ActivityNotify> {
        if self.notify.is_some() && (self.force_fire || !self.pending.is_empty()) {
            self.force_fire = false;
            self.notify.take()
        } else {
            None
        }
    }
}

/// Scripted hardware codec stand-in.
///
/// Decodes synchronously at `enqueue_input` time: each accepted sample
/// yields `outputs_per_input` pending output buffers that become available
/// to `dequeue_output` immediately, with activity notifications fired the
/// way a real driver would.
pub struct MockCodec {
    shared: Arc<Mutex<MockState>>,
}

/// Test-side handle for scripting and inspecting a [`MockCodec`] after the
/// codec itself has been handed to the pipeline.
#[derive(Clone)]
pub struct MockProbe {
    shared: Arc<Mutex<MockState>>,
}

impl MockCodec {
    fn with_state(audio: Option<AudioFormat>, geometry: Option<FrameGeometry>) -> (Self, MockProbe) {
        let slots = 4usize;
        let shared = Arc::new(Mutex::new(MockState {
            allocated: false,
            started: false,
            input_slots: SlotArena::new(slots),
            output_slots: SlotArena::new(slots),
            slot_data: vec![Bytes::new(); slots],
            slot_eos: vec![false; slots],
            pending: VecDeque::new(),
            notify: None,
            force_fire: false,
            blocked_inputs: 0,
            fatal: None,
            audio,
            geometry,
            outputs_per_input: 1,
            output_size: 0,
            graphics_backed: false,
            next_image: 1,
            flush_count: 0,
            released: false,
        }));
        (
            Self {
                shared: Arc::clone(&shared),
            },
            MockProbe { shared },
        )
    }

    /// An audio codec producing 16-bit PCM in the given format.
    pub fn audio(format: AudioFormat) -> (Self, MockProbe) {
        Self::with_state(Some(format), None)
    }

    /// A video codec producing frames with the given geometry.
    pub fn video(geometry: FrameGeometry) -> (Self, MockProbe) {
        Self::with_state(None, Some(geometry))
    }

    /// Runs `f` under the state lock, then fires any notification that
    /// became ready. The callback only posts into a channel, but it is still
    /// invoked outside the lock so backends and callers can never deadlock
    /// through it.
    fn locked<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let (ret, notify) = {
            let mut state = self.shared.lock();
            let ret = f(&mut state);
            (ret, state.ready_notify())
        };
        if let Some(notify) = notify {
            notify();
        }
        ret
    }
}

impl MockProbe {
    fn locked<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let (ret, notify) = {
            let mut state = self.shared.lock();
            let ret = f(&mut state);
            (ret, state.ready_notify())
        };
        if let Some(notify) = notify {
            notify();
        }
        ret
    }

    /// Makes the next `count` input dequeues report `WouldBlock`.
    pub fn block_inputs(&self, count: usize) {
        self.locked(|s| s.blocked_inputs = count);
    }

    /// Clears input blocking and fires the armed activity notification, the
    /// way the driver signals "you may retry now".
    pub fn unblock(&self) {
        self.locked(|s| {
            s.blocked_inputs = 0;
            s.force_fire = true;
        });
    }

    /// Each accepted input sample yields this many output buffers.
    pub fn set_outputs_per_input(&self, n: usize) {
        self.locked(|s| s.outputs_per_input = n.max(1));
    }

    /// Fixes the decoded payload size per output buffer (default: echo the
    /// encoded payload).
    pub fn set_output_size(&self, bytes: usize) {
        self.locked(|s| s.output_size = bytes);
    }

    /// Makes output buffers graphics-memory-backed.
    pub fn set_graphics_backed(&self, graphics: bool) {
        self.locked(|s| s.graphics_backed = graphics);
    }

    /// Queues a format change; the next `dequeue_output` reports it and the
    /// codec switches to the new format.
    pub fn change_audio_format(&self, format: AudioFormat) {
        self.locked(|s| {
            s.audio = Some(format);
            s.produce(Produced::FormatChange);
        });
    }

    /// Queues a geometry change for video streams.
    pub fn change_geometry(&self, geometry: FrameGeometry) {
        self.locked(|s| {
            s.geometry = Some(geometry);
            s.produce(Produced::FormatChange);
        });
    }

    /// Makes the next `dequeue_output` fail fatally.
    pub fn inject_fatal(&self, reason: impl Into<String>) {
        self.locked(|s| {
            s.fatal = Some(reason.into());
            s.force_fire = true;
        });
    }

    /// Output slots currently checked out to software. Zero after shutdown
    /// means no slot leaked.
    pub fn outstanding_outputs(&self) -> usize {
        self.shared.lock().output_slots.outstanding()
    }

    pub fn outstanding_inputs(&self) -> usize {
        self.shared.lock().input_slots.outstanding()
    }

    pub fn flush_count(&self) -> u32 {
        self.shared.lock().flush_count
    }

    pub fn released(&self) -> bool {
        self.shared.lock().released
    }
}

impl CodecBackend for MockCodec {
    fn allocate(&mut self) -> CodecStatus<()> {
        self.locked(|s| {
            s.allocated = true;
            Ok(())
        })
    }

    fn configure(&mut self, config: &CodecConfig) -> CodecStatus<()> {
        self.locked(|s| {
            if !s.allocated {
                return Err(CodecError::NotInitialized);
            }
            debug!(mime = %config.mime, kind = config.kind.as_str(), "mock codec configured");
            Ok(())
        })
    }

    fn start(&mut self) -> CodecStatus<()> {
        self.locked(|s| {
            if !s.allocated {
                return Err(CodecError::NotInitialized);
            }
            s.started = true;
            Ok(())
        })
    }

    fn stop(&mut self) -> CodecStatus<()> {
        self.locked(|s| {
            s.started = false;
            Ok(())
        })
    }

    fn release(&mut self) -> CodecStatus<()> {
        self.locked(|s| {
            s.allocated = false;
            s.started = false;
            s.released = true;
            s.pending.clear();
            s.notify = None;
            // The hardware reclaims its pool on release; outstanding
            // checkouts at this point are leaks the tests assert on.
            Ok(())
        })
    }

    fn flush(&mut self) -> CodecStatus<()> {
        self.locked(|s| {
            if !s.allocated {
                return Err(CodecError::NotInitialized);
            }
            s.pending.clear();
            s.input_slots.restore_all();
            s.flush_count += 1;
            Ok(())
        })
    }

    fn dequeue_input(&self, _timeout: Duration) -> CodecStatus<BufferSlot> {
        self.locked(|s| {
            if !s.started {
                return Err(CodecError::NotInitialized);
            }
            if s.blocked_inputs > 0 {
                s.blocked_inputs -= 1;
                trace!("mock input dequeue blocked");
                return Err(CodecError::WouldBlock);
            }
            s.input_slots.checkout_free().ok_or(CodecError::WouldBlock)
        })
    }

    fn enqueue_input(
        &self,
        slot: BufferSlot,
        payload: &[u8],
        time_us: i64,
        flags: u32,
    ) -> CodecStatus<()> {
        self.locked(|s| {
            if !s.started {
                return Err(CodecError::NotInitialized);
            }
            s.input_slots
                .restore(slot)
                .map_err(|e| CodecError::Fatal(e.to_string()))?;
            if flags & FLAG_CODEC_CONFIG != 0 {
                trace!(%slot, "mock accepted codec config");
                return Ok(());
            }
            if flags & FLAG_EOS != 0 {
                s.produce(Produced::Buffer {
                    data: Bytes::new(),
                    time_us: 0,
                    eos: true,
                });
                return Ok(());
            }
            let data = if s.output_size == 0 {
                Bytes::copy_from_slice(payload)
            } else {
                Bytes::from(vec![0u8; s.output_size])
            };
            for _ in 0..s.outputs_per_input {
                s.produce(Produced::Buffer {
                    data: data.clone(),
                    time_us,
                    eos: false,
                });
            }
            Ok(())
        })
    }

    fn dequeue_output(&self, _timeout: Duration) -> CodecStatus<OutputBuffer> {
        self.locked(|s| {
            if !s.started {
                return Err(CodecError::NotInitialized);
            }
            if let Some(reason) = s.fatal.take() {
                return Err(CodecError::Fatal(reason));
            }
            match s.pending.pop_front() {
                None => Err(CodecError::WouldBlock),
                Some(Produced::FormatChange) => Err(CodecError::FormatChanged),
                Some(Produced::Buffer { data, time_us, eos }) => {
                    let Some(slot) = s.output_slots.checkout_free() else {
                        // No free output slot; the buffer stays pending.
                        s.pending.push_front(Produced::Buffer { data, time_us, eos });
                        return Err(CodecError::WouldBlock);
                    };
                    let size = data.len();
                    s.slot_data[slot.0] = data;
                    s.slot_eos[slot.0] = eos;
                    Ok(OutputBuffer {
                        slot,
                        offset: 0,
                        size,
                        time_us,
                        flags: if eos { FLAG_EOS } else { 0 },
                    })
                }
            }
        })
    }

    fn output_data(&self, slot: BufferSlot) -> CodecStatus<Bytes> {
        self.locked(|s| {
            s.slot_data
                .get(slot.0)
                .cloned()
                .ok_or_else(|| CodecError::Fatal(format!("{slot} out of range")))
        })
    }

    fn output_image(&self, slot: BufferSlot) -> CodecStatus<Option<ImageHandle>> {
        self.locked(|s| {
            if slot.0 >= s.slot_data.len() {
                return Err(CodecError::Fatal(format!("{slot} out of range")));
            }
            if s.graphics_backed && !s.slot_eos[slot.0] {
                let handle = ImageHandle(s.next_image);
                s.next_image += 1;
                Ok(Some(handle))
            } else {
                Ok(None)
            }
        })
    }

    fn release_output(&self, slot: BufferSlot) -> CodecStatus<()> {
        self.locked(|s| {
            s.output_slots
                .restore(slot)
                .map_err(|e| CodecError::Fatal(e.to_string()))?;
            s.slot_data[slot.0] = Bytes::new();
            s.slot_eos[slot.0] = false;
            Ok(())
        })
    }

    fn output_format(&self) -> CodecStatus<OutputFormat> {
        self.locked(|s| {
            if !s.allocated {
                return Err(CodecError::NotInitialized);
            }
            Ok(OutputFormat {
                audio: s.audio,
                geometry: s.geometry,
            })
        })
    }

    fn request_activity_notification(&self, notify: ActivityNotify) {
        self.locked(|s| {
            // One outstanding notification at a time; a re-registration
            // replaces the previous callback.
            s.notify = Some(notify);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo() -> AudioFormat {
        AudioFormat {
            channels: 2,
            sample_rate: 44_100,
        }
    }

    #[test]
    fn mock_round_trip_produces_one_output_per_input() {
        let (mut codec, probe) = MockCodec::audio(stereo());
        codec.allocate().unwrap();
        codec.start().unwrap();

        let slot = codec.dequeue_input(Duration::ZERO).unwrap();
        codec.enqueue_input(slot, b"abcd", 1000, 0).unwrap();

        let out = codec.dequeue_output(Duration::ZERO).unwrap();
        assert_eq!(out.time_us, 1000);
        assert_eq!(out.size, 4);
        assert!(!out.is_eos());
        assert_eq!(probe.outstanding_outputs(), 1);

        codec.release_output(out.slot).unwrap();
        assert_eq!(probe.outstanding_outputs(), 0);
        assert!(matches!(
            codec.dequeue_output(Duration::ZERO),
            Err(CodecError::WouldBlock)
        ));
    }

    #[test]
    fn eos_input_yields_eos_output() {
        let (mut codec, _probe) = MockCodec::audio(stereo());
        codec.allocate().unwrap();
        codec.start().unwrap();

        let slot = codec.dequeue_input(Duration::ZERO).unwrap();
        codec.enqueue_input(slot, &[], 0, FLAG_EOS).unwrap();

        let out = codec.dequeue_output(Duration::ZERO).unwrap();
        assert!(out.is_eos());
        assert_eq!(out.size, 0);
    }

    #[test]
    fn blocked_inputs_release_via_notification() {
        let (mut codec, probe) = MockCodec::audio(stereo());
        codec.allocate().unwrap();
        codec.start().unwrap();
        probe.block_inputs(2);

        assert!(matches!(
            codec.dequeue_input(Duration::ZERO),
            Err(CodecError::WouldBlock)
        ));

        let fired = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&fired);
        codec.request_activity_notification(Box::new(move || *flag.lock() = true));
        probe.unblock();
        assert!(*fired.lock());
        assert!(codec.dequeue_input(Duration::ZERO).is_ok());
    }

    #[test]
    fn format_change_precedes_buffers() {
        let (mut codec, probe) = MockCodec::audio(stereo());
        codec.allocate().unwrap();
        codec.start().unwrap();

        probe.change_audio_format(AudioFormat {
            channels: 1,
            sample_rate: 48_000,
        });
        let slot = codec.dequeue_input(Duration::ZERO).unwrap();
        codec.enqueue_input(slot, b"abcd", 0, 0).unwrap();

        assert!(matches!(
            codec.dequeue_output(Duration::ZERO),
            Err(CodecError::FormatChanged)
        ));
        assert_eq!(codec.output_format().unwrap().audio.unwrap().sample_rate, 48_000);
        assert!(codec.dequeue_output(Duration::ZERO).is_ok());
    }

    #[test]
    fn io_before_start_reports_not_initialized() {
        let (codec, _probe) = MockCodec::audio(stereo());
        assert!(matches!(
            codec.dequeue_input(Duration::ZERO),
            Err(CodecError::NotInitialized)
        ));
    }
}
