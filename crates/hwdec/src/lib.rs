//! Asynchronous hardware decode pipelines over index-based codec buffers.
//!
//! The crate is organized around one thread per decoder:
//!
//! - [`backend`] defines the [`CodecBackend`](backend::CodecBackend) trait,
//!   the narrow per-platform surface (buffer pools addressed by slot index,
//!   non-blocking dequeues, activity notifications), plus a scripted mock.
//! - [`codec`] wraps a backend in the read/write lock discipline that lets
//!   buffer I/O and lifecycle calls coexist.
//! - [`broker`] reserves scarce hardware decoder instances asynchronously.
//! - [`manager`] runs the pipeline state machine on its own thread, feeding
//!   input until the codec blocks and draining output on notifications.
//! - [`audio`] / [`video`] turn raw output buffers into PCM blocks and
//!   frames.
//! - [`facade`] is the public handle: futures for init, decode, flush,
//!   drain, and shutdown.
//!
//! ```no_run
//! use hwdec::{AudioFormat, CodecConfig, DecoderFacade, MockCodec, ResourceBroker, Sample};
//!
//! let format = AudioFormat { channels: 2, sample_rate: 48_000 };
//! let (codec, _probe) = MockCodec::audio(format);
//! let broker = ResourceBroker::unlimited();
//! let decoder = DecoderFacade::audio(
//!     CodecConfig::audio("audio/mp4a-latm", format),
//!     Box::new(codec),
//!     broker,
//! )?;
//! decoder.init().wait()?;
//! let units = decoder.decode(Sample::new(vec![0u8; 128].into(), 0, 0)).wait()?;
//! # let _ = units;
//! # Ok::<(), hwdec::DecodeError>(())
//! ```

pub mod audio;
pub mod backend;
pub mod broker;
pub mod codec;
pub mod error;
pub mod facade;
pub mod manager;
pub mod sample;
pub mod slots;
pub mod video;

pub use audio::AudioOutputAssembler;
pub use backend::{
    ActivityNotify, CodecBackend, CodecConfig, MockCodec, MockProbe, OutputBuffer, OutputFormat,
    FLAG_CODEC_CONFIG, FLAG_EOS,
};
pub use broker::{BrokerLimits, ReservationToken, ResourceBroker, ResourceKind};
pub use codec::CodecHandle;
pub use error::{CodecError, CodecStatus, DecodeError};
pub use facade::{DecoderFacade, PipelineFuture};
pub use manager::{OutputAssembler, PipelineState};
pub use sample::{
    AudioFormat, CropRect, DecodedPayload, DecodedUnit, FrameGeometry, ImageHandle, PcmBlock,
    Sample, TrackKind, VideoFrameUnit, VideoPixels,
};
pub use slots::{BufferSlot, SlotArena, SlotError};
pub use video::VideoOutputAssembler;
