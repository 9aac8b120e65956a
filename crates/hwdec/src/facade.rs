//! Public entry point of the decode pipeline.
//!
//! [`DecoderFacade`] spawns one manager thread per decoder and turns the
//! command/reply channel into futures, so callers drive the pipeline from
//! async code (or block on [`PipelineFuture::wait`]) without touching the
//! codec thread directly.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use tokio::sync::oneshot;
use tracing::debug;

use crate::audio::AudioOutputAssembler;
use crate::backend::{CodecBackend, CodecConfig};
use crate::broker::ResourceBroker;
use crate::codec::CodecHandle;
use crate::error::DecodeError;
use crate::manager::{Command, DecoderManager, OutputAssembler, ReplyTo};
use crate::sample::{DecodedUnit, Sample, TrackKind};
use crate::video::VideoOutputAssembler;

/// Resolves with the outcome of one pipeline operation. If the pipeline
/// goes away before answering, the future resolves with
/// [`DecodeError::Cancelled`].
pub struct PipelineFuture<T> {
    rx: oneshot::Receiver<Result<T, DecodeError>>,
}

impl<T> PipelineFuture<T> {
    fn ready(value: Result<T, DecodeError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(value);
        Self { rx }
    }

    /// Blocks the calling thread until the operation completes. Must not be
    /// called from an async runtime thread.
    pub fn wait(self) -> Result<T, DecodeError> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(DecodeError::Cancelled))
    }
}

impl<T> Future for PipelineFuture<T> {
    type Output = Result<T, DecodeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(DecodeError::Cancelled)))
    }
}

/// Handle to one running decoder pipeline. Dropping the facade shuts the
/// pipeline down and joins its thread.
pub struct DecoderFacade {
    kind: TrackKind,
    tx: Sender<Command>,
    worker: Option<JoinHandle<()>>,
    shut: AtomicBool,
}

impl DecoderFacade {
    /// Spawns a pipeline with an explicit output assembler.
    pub fn new(
        config: CodecConfig,
        backend: Box<dyn CodecBackend>,
        assembler: Box<dyn OutputAssembler>,
        broker: Arc<ResourceBroker>,
    ) -> Result<Self, DecodeError> {
        let kind = config.kind;
        let (tx, rx) = unbounded();
        let codec = Arc::new(CodecHandle::new());
        let manager = DecoderManager::new(config, codec, backend, assembler, broker, tx.clone());
        let worker = thread::Builder::new()
            .name(format!("hwdec-{}", kind.as_str()))
            .spawn(move || manager.run(rx))
            .map_err(|err| DecodeError::Fatal(format!("failed to spawn manager: {err}")))?;
        Ok(Self {
            kind,
            tx,
            worker: Some(worker),
            shut: AtomicBool::new(false),
        })
    }

    /// Spawns an audio pipeline; the config must carry an initial
    /// [`AudioFormat`](crate::sample::AudioFormat).
    pub fn audio(
        config: CodecConfig,
        backend: Box<dyn CodecBackend>,
        broker: Arc<ResourceBroker>,
    ) -> Result<Self, DecodeError> {
        let format = config
            .audio
            .ok_or(DecodeError::InvalidState("audio config without a format"))?;
        let assembler = Box::new(AudioOutputAssembler::new(format));
        Self::new(config, backend, assembler, broker)
    }

    /// Spawns a video pipeline; the config must carry an initial
    /// [`FrameGeometry`](crate::sample::FrameGeometry).
    pub fn video(
        config: CodecConfig,
        backend: Box<dyn CodecBackend>,
        broker: Arc<ResourceBroker>,
        frame_duration_us: i64,
    ) -> Result<Self, DecodeError> {
        let geometry = config
            .geometry
            .ok_or(DecodeError::InvalidState("video config without geometry"))?;
        let assembler = Box::new(VideoOutputAssembler::new(geometry, frame_duration_us));
        Self::new(config, backend, assembler, broker)
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    fn send<T>(&self, make: impl FnOnce(ReplyTo<T>) -> Command) -> PipelineFuture<T> {
        let (reply, rx) = oneshot::channel();
        // A failed send drops the reply sender with the command, which
        // resolves the future as Cancelled.
        let _ = self.tx.send(make(reply));
        PipelineFuture { rx }
    }

    /// Reserves the hardware and brings the codec up. Resolves once the
    /// pipeline is ready for [`decode`](Self::decode).
    pub fn init(&self) -> PipelineFuture<TrackKind> {
        self.send(|reply| Command::Init { reply })
    }

    /// Submits one encoded sample. Resolves with zero or more decoded units
    /// once the codec has absorbed enough input for the next sample; at
    /// most one decode may be in flight.
    pub fn decode(&self, sample: Sample) -> PipelineFuture<Vec<DecodedUnit>> {
        self.send(|reply| Command::Decode { sample, reply })
    }

    /// Discards everything in flight and re-arms the pipeline for seeking.
    pub fn flush(&self) -> PipelineFuture<()> {
        self.send(|reply| Command::Flush { reply })
    }

    /// Signals end of stream and resolves with all remaining decoded units.
    pub fn drain(&self) -> PipelineFuture<Vec<DecodedUnit>> {
        self.send(|reply| Command::Drain { reply })
    }

    /// Tears the pipeline down and releases the hardware. Safe to call more
    /// than once; repeats resolve immediately.
    pub fn shutdown(&self) -> PipelineFuture<()> {
        if self.shut.swap(true, Ordering::AcqRel) {
            return PipelineFuture::ready(Ok(()));
        }
        self.send(|reply| Command::Shutdown { reply })
    }
}

impl Drop for DecoderFacade {
    fn drop(&mut self) {
        if !self.shut.swap(true, Ordering::AcqRel) {
            let _ = self.send(|reply| Command::Shutdown { reply });
        }
        if let Some(worker) = self.worker.take() {
            debug!(kind = self.kind.as_str(), "joining manager thread");
            let _ = worker.join();
        }
    }
}
