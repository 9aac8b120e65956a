//! The decode pipeline state machine.
//!
//! [`DecoderManager`] owns one codec instance and runs on a dedicated
//! thread, consuming [`Command`]s from a channel. All codec I/O is
//! non-blocking: input submission stops at `WouldBlock`, output is drained
//! in bounded bursts, and progress between bursts is driven by codec
//! activity notifications rather than polling.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::backend::{CodecBackend, CodecConfig, OutputBuffer, FLAG_CODEC_CONFIG, FLAG_EOS};
use crate::broker::{ReservationToken, ResourceBroker, ResourceKind};
use crate::codec::CodecHandle;
use crate::error::{CodecError, DecodeError};
use crate::sample::{DecodedUnit, Sample, TrackKind};

/// Input dequeues never wait; a full input pool surfaces as `WouldBlock`
/// and is retried on the next activity notification.
const INPUT_TIMEOUT: Duration = Duration::ZERO;
/// Output dequeues never wait either.
const OUTPUT_TIMEOUT: Duration = Duration::ZERO;
/// Codec-specific config is submitted before the first sample and may wait
/// briefly for an input slot.
const CODEC_CONFIG_TIMEOUT: Duration = Duration::from_millis(40);
const CODEC_CONFIG_RETRIES: u32 = 3;
/// A pending decode request resolves once the codec has absorbed input down
/// to this many queued samples, so the feeder stays ahead of the hardware.
const MIN_QUEUED_SAMPLES: usize = 2;
/// Output buffers drained per activity notification. Anything beyond this
/// re-arms the notification instead of looping unboundedly.
const MAX_POLL_RETRIES: usize = 8;

/// Converts dequeued output buffers into decoded units for one track type.
///
/// The audio and video pipelines differ only here: how a buffer's bytes (or
/// graphics handle) become [`DecodedUnit`]s, and how a format change is
/// absorbed.
pub trait OutputAssembler: Send {
    fn track_kind(&self) -> TrackKind;
    /// Re-reads the codec's output format. Called once at start-up and
    /// after every format-change event.
    fn refresh_format(&mut self, codec: &CodecHandle) -> Result<(), DecodeError>;
    /// Converts one dequeued output buffer. The slot is still checked out
    /// while this runs; the manager releases it afterwards. `stream_offset`
    /// is the source-stream byte offset of the wait-list entry this output
    /// was matched to, or -1 when none matched.
    fn assemble(
        &mut self,
        codec: &CodecHandle,
        buffer: &OutputBuffer,
        stream_offset: i64,
    ) -> Result<Vec<DecodedUnit>, DecodeError>;
    /// Called before the codec itself is flushed.
    fn on_flush(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Initializing,
    Running,
    Flushing,
    Draining,
    Eos,
    ShuttingDown,
    Shutdown,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Flushing => "flushing",
            Self::Draining => "draining",
            Self::Eos => "eos",
            Self::ShuttingDown => "shutting-down",
            Self::Shutdown => "shutdown",
        }
    }
}

pub(crate) type ReplyTo<T> = tokio::sync::oneshot::Sender<Result<T, DecodeError>>;

pub(crate) enum Command {
    Init {
        reply: ReplyTo<TrackKind>,
    },
    Decode {
        sample: Sample,
        reply: ReplyTo<Vec<DecodedUnit>>,
    },
    Flush {
        reply: ReplyTo<()>,
    },
    Drain {
        reply: ReplyTo<Vec<DecodedUnit>>,
    },
    Shutdown {
        reply: ReplyTo<()>,
    },
    /// The codec signalled it can make progress again.
    Activity,
    /// Outcome of the broker reservation requested during init.
    Reservation(Result<ReservationToken, DecodeError>),
}

/// One submitted input awaiting its decoded counterpart(s). Popped once an
/// output with an equal or later timestamp arrives; the end-of-stream entry
/// only leaves through the EOS output or a flush.
struct WaitEntry {
    offset: i64,
    time_us: i64,
    eos: bool,
}

pub(crate) struct DecoderManager {
    state: PipelineState,
    config: CodecConfig,
    codec: Arc<CodecHandle>,
    /// Backend held until the reservation is granted, then installed.
    backend: Option<Box<dyn CodecBackend>>,
    assembler: Box<dyn OutputAssembler>,
    broker: Arc<ResourceBroker>,
    token: Option<ReservationToken>,
    tx: Sender<Command>,

    /// Samples accepted but not yet submitted to the codec.
    queued: VecDeque<Sample>,
    /// Submitted inputs still owed output.
    wait: VecDeque<WaitEntry>,
    /// Decoded units awaiting delivery through the next resolving future.
    buffered: Vec<DecodedUnit>,

    init_reply: Option<ReplyTo<TrackKind>>,
    decode_reply: Option<ReplyTo<Vec<DecodedUnit>>>,
    drain_reply: Option<ReplyTo<Vec<DecodedUnit>>>,

    notify_armed: bool,
    eos_pending: bool,
    last_output_time: i64,
}

impl DecoderManager {
    pub(crate) fn new(
        config: CodecConfig,
        codec: Arc<CodecHandle>,
        backend: Box<dyn CodecBackend>,
        assembler: Box<dyn OutputAssembler>,
        broker: Arc<ResourceBroker>,
        tx: Sender<Command>,
    ) -> Self {
        Self {
            state: PipelineState::Idle,
            config,
            codec,
            backend: Some(backend),
            assembler,
            broker,
            token: None,
            tx,
            queued: VecDeque::new(),
            wait: VecDeque::new(),
            buffered: Vec::new(),
            init_reply: None,
            decode_reply: None,
            drain_reply: None,
            notify_armed: false,
            eos_pending: false,
            last_output_time: i64::MIN,
        }
    }

    pub(crate) fn run(mut self, rx: Receiver<Command>) {
        debug!(kind = self.config.kind.as_str(), "manager thread up");
        for command in rx.iter() {
            if self.handle(command).is_break() {
                break;
            }
        }
        // The codec must not outlive the manager even on an abnormal exit.
        self.teardown();
        debug!(kind = self.config.kind.as_str(), "manager thread down");
    }

    fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Init { reply } => self.handle_init(reply),
            Command::Reservation(outcome) => self.handle_reservation(outcome),
            Command::Decode { sample, reply } => self.handle_decode(sample, reply),
            Command::Flush { reply } => self.handle_flush(reply),
            Command::Drain { reply } => self.handle_drain(reply),
            Command::Activity => self.process_activity(),
            Command::Shutdown { reply } => {
                self.handle_shutdown();
                let _ = reply.send(Ok(()));
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    // --- init ---

    fn handle_init(&mut self, reply: ReplyTo<TrackKind>) {
        if self.state != PipelineState::Idle {
            let _ = reply.send(Err(DecodeError::InvalidState("init on a used pipeline")));
            return;
        }
        self.state = PipelineState::Initializing;
        self.init_reply = Some(reply);

        let kind = match self.config.kind {
            TrackKind::Audio => ResourceKind::AudioDecoder,
            TrackKind::Video => ResourceKind::VideoDecoder,
        };
        let tx = self.tx.clone();
        // If the manager is gone by grant time the send fails and the token
        // drops, returning the unit to the pool.
        self.broker.reserve(
            kind,
            Box::new(move |outcome| {
                let _ = tx.send(Command::Reservation(outcome));
            }),
        );
    }

    fn handle_reservation(&mut self, outcome: Result<ReservationToken, DecodeError>) {
        if self.state != PipelineState::Initializing {
            // Init was abandoned (e.g. shutdown raced the grant); dropping
            // the token re-credits the pool.
            return;
        }
        match outcome {
            Err(err) => {
                debug!(%err, "reservation failed");
                self.resolve_init(Err(err));
                self.state = PipelineState::Shutdown;
            }
            Ok(token) => {
                self.token = Some(token);
                match self.bring_up() {
                    Ok(kind) => {
                        self.state = PipelineState::Running;
                        self.resolve_init(Ok(kind));
                    }
                    Err(err) => {
                        warn!(%err, "codec bring-up failed");
                        self.resolve_init(Err(err));
                        self.teardown();
                        self.state = PipelineState::Shutdown;
                    }
                }
            }
        }
    }

    fn bring_up(&mut self) -> Result<TrackKind, DecodeError> {
        let backend = self
            .backend
            .take()
            .ok_or(DecodeError::InvalidState("backend already consumed"))?;
        self.codec.install(backend)?;
        self.codec.configure(&self.config)?;
        self.codec.start()?;
        if let Some(csd) = self.config.codec_specific.clone() {
            self.submit_codec_config(&csd)?;
        }
        self.assembler.refresh_format(&self.codec)?;
        Ok(self.config.kind)
    }

    /// Codec-specific data must reach the codec before any sample; a busy
    /// input pool here is retried a few times, then treated as fatal.
    fn submit_codec_config(&self, csd: &[u8]) -> Result<(), DecodeError> {
        for attempt in 0..CODEC_CONFIG_RETRIES {
            match self
                .codec
                .submit(csd, 0, FLAG_CODEC_CONFIG, CODEC_CONFIG_TIMEOUT)
            {
                Ok(()) => return Ok(()),
                Err(CodecError::WouldBlock) => {
                    trace!(attempt, "codec config submission blocked, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(DecodeError::Fatal(
            "codec rejected configuration data".into(),
        ))
    }

    fn resolve_init(&mut self, outcome: Result<TrackKind, DecodeError>) {
        if let Some(reply) = self.init_reply.take() {
            let _ = reply.send(outcome);
        }
    }

    // --- decode / drain / flush ---

    fn handle_decode(&mut self, sample: Sample, reply: ReplyTo<Vec<DecodedUnit>>) {
        match self.state {
            PipelineState::Draining | PipelineState::Eos => {
                let _ = reply.send(Err(DecodeError::EndOfStream));
            }
            PipelineState::Running => {
                if self.decode_reply.is_some() {
                    let _ = reply.send(Err(DecodeError::InvalidState(
                        "decode already in flight",
                    )));
                    return;
                }
                self.decode_reply = Some(reply);
                self.queued.push_back(sample);
                self.pump();
            }
            state => {
                let _ = reply.send(Err(DecodeError::InvalidState(state.as_str())));
            }
        }
    }

    fn handle_drain(&mut self, reply: ReplyTo<Vec<DecodedUnit>>) {
        match self.state {
            // A repeat drain hands over whatever is left, immediately.
            PipelineState::Eos | PipelineState::Draining => {
                let _ = reply.send(Ok(std::mem::take(&mut self.buffered)));
            }
            PipelineState::Running => {
                self.state = PipelineState::Draining;
                self.eos_pending = true;
                self.drain_reply = Some(reply);
                self.queued.push_back(Sample::eos());
                if let Err(err) = self.submit_queued() {
                    self.fail(err);
                    return;
                }
                self.arm_notification();
            }
            state => {
                let _ = reply.send(Err(DecodeError::InvalidState(state.as_str())));
            }
        }
    }

    fn handle_flush(&mut self, reply: ReplyTo<()>) {
        match self.state {
            PipelineState::Running | PipelineState::Draining | PipelineState::Eos => {
                self.state = PipelineState::Flushing;
                self.queued.clear();
                self.wait.clear();
                self.buffered.clear();
                self.eos_pending = false;
                self.last_output_time = i64::MIN;
                // The assembler arms its post-flush behavior before the
                // codec discards buffers.
                self.assembler.on_flush();
                if let Some(r) = self.decode_reply.take() {
                    let _ = r.send(Ok(Vec::new()));
                }
                if let Some(r) = self.drain_reply.take() {
                    let _ = r.send(Ok(Vec::new()));
                }
                match self.codec.flush() {
                    Ok(()) => {
                        self.state = PipelineState::Running;
                        let _ = reply.send(Ok(()));
                    }
                    Err(err) => {
                        let err = DecodeError::from(err);
                        let _ = reply.send(Err(err.clone()));
                        self.fail(err);
                    }
                }
            }
            state => {
                let _ = reply.send(Err(DecodeError::InvalidState(state.as_str())));
            }
        }
    }

    fn handle_shutdown(&mut self) {
        self.state = PipelineState::ShuttingDown;
        if let Some(r) = self.init_reply.take() {
            let _ = r.send(Err(DecodeError::Cancelled));
        }
        if let Some(r) = self.decode_reply.take() {
            let _ = r.send(Err(DecodeError::Cancelled));
        }
        if let Some(r) = self.drain_reply.take() {
            let _ = r.send(Err(DecodeError::Cancelled));
        }
        self.teardown();
        self.state = PipelineState::Shutdown;
    }

    // --- input side ---

    /// Feeds queued samples, collects any output that is already waiting,
    /// and decides whether the pending decode request can resolve yet. The
    /// output pass comes first: units the codec has finished must travel
    /// with this resolution, not sit unclaimed until the next call.
    fn pump(&mut self) {
        if let Err(err) = self.submit_queued() {
            self.fail(err);
            return;
        }
        if let Err(err) = self.drain_outputs() {
            self.fail(err);
            return;
        }
        if !self.buffered.is_empty()
            || (!self.eos_pending && self.queued.len() <= MIN_QUEUED_SAMPLES)
        {
            self.resolve_decode();
        }
        self.arm_notification();
    }

    /// Submits queued samples until the codec's input pool is exhausted.
    fn submit_queued(&mut self) -> Result<(), DecodeError> {
        while let Some(sample) = self.queued.front() {
            let offset = sample.offset;
            let time_us = sample.time_us;
            let eos = sample.is_eos();
            let flags = if eos { FLAG_EOS } else { 0 };
            match self
                .codec
                .submit(&sample.payload, time_us, flags, INPUT_TIMEOUT)
            {
                Ok(()) => {
                    self.queued.pop_front();
                    self.wait.push_back(WaitEntry {
                        offset,
                        time_us,
                        eos,
                    });
                    trace!(time_us, eos, "input submitted");
                }
                Err(CodecError::WouldBlock) => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Keeps exactly one activity notification outstanding while there is
    /// unfinished work.
    fn arm_notification(&mut self) {
        if self.notify_armed {
            return;
        }
        if self.queued.is_empty() && self.wait.is_empty() {
            return;
        }
        let tx = self.tx.clone();
        let armed = self.codec.request_activity_notification(Box::new(move || {
            let _ = tx.send(Command::Activity);
        }));
        if armed.is_ok() {
            self.notify_armed = true;
        }
    }

    // --- output side ---

    fn process_activity(&mut self) {
        self.notify_armed = false;
        if !matches!(self.state, PipelineState::Running | PipelineState::Draining) {
            return;
        }
        self.pump();
    }

    /// Drains up to [`MAX_POLL_RETRIES`] output buffers. Each dequeued slot
    /// is released exactly once, on success and failure alike.
    fn drain_outputs(&mut self) -> Result<(), DecodeError> {
        for _ in 0..MAX_POLL_RETRIES {
            let out = match self.codec.dequeue_output(OUTPUT_TIMEOUT) {
                Ok(out) => out,
                Err(CodecError::WouldBlock) => break,
                Err(CodecError::FormatChanged) => {
                    debug!("output format changed");
                    self.assembler.refresh_format(&self.codec)?;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            if out.is_eos() {
                if out.size > 0 {
                    let assembled = self.assembler.assemble(&self.codec, &out, -1);
                    self.codec.release_output(out.slot)?;
                    self.buffered.extend(assembled?);
                } else {
                    self.codec.release_output(out.slot)?;
                }
                self.wait.clear();
                self.state = PipelineState::Eos;
                self.finish_drain();
                return Ok(());
            }

            if out.time_us < self.last_output_time {
                self.codec.release_output(out.slot)?;
                return Err(DecodeError::Fatal(format!(
                    "output timestamps regressed: {} after {}",
                    out.time_us, self.last_output_time
                )));
            }
            self.last_output_time = out.time_us;

            // The front wait entry is the input this output answers; later
            // chunks of a many-output input find no entry and carry -1.
            let stream_offset = match self.wait.front() {
                Some(front) if !front.eos && front.time_us <= out.time_us => front.offset,
                _ => -1,
            };
            let assembled = self.assembler.assemble(&self.codec, &out, stream_offset);
            self.codec.release_output(out.slot)?;
            self.buffered.extend(assembled?);
            self.forget_waiters(out.time_us);
        }
        Ok(())
    }

    /// Inputs with timestamps at or before `forget_up_to` have produced
    /// their output; the EOS entry only leaves via the EOS output.
    fn forget_waiters(&mut self, forget_up_to: i64) {
        while let Some(front) = self.wait.front() {
            if front.eos || front.time_us > forget_up_to {
                break;
            }
            self.wait.pop_front();
        }
    }

    fn resolve_decode(&mut self) {
        if let Some(reply) = self.decode_reply.take() {
            let _ = reply.send(Ok(std::mem::take(&mut self.buffered)));
        }
    }

    fn finish_drain(&mut self) {
        debug!(units = self.buffered.len(), "drain complete");
        self.eos_pending = false;
        if let Some(reply) = self.decode_reply.take() {
            let _ = reply.send(Ok(Vec::new()));
        }
        if let Some(reply) = self.drain_reply.take() {
            let _ = reply.send(Ok(std::mem::take(&mut self.buffered)));
        }
    }

    // --- failure and teardown ---

    fn fail(&mut self, err: DecodeError) {
        warn!(%err, "pipeline failure");
        // Tear down before answering, so a rejected future never observes
        // the codec still held.
        self.teardown();
        self.state = PipelineState::Shutdown;
        if let Some(r) = self.init_reply.take() {
            let _ = r.send(Err(err.clone()));
        }
        if let Some(r) = self.decode_reply.take() {
            let _ = r.send(Err(err.clone()));
        }
        if let Some(r) = self.drain_reply.take() {
            let _ = r.send(Err(err));
        }
    }

    fn teardown(&mut self) {
        self.queued.clear();
        self.wait.clear();
        self.buffered.clear();
        if self.codec.is_installed() {
            if let Err(err) = self.codec.stop() {
                debug!(%err, "codec stop reported an error");
            }
            self.codec.release();
        }
        // Dropping the token returns the hardware unit to the broker.
        self.token = None;
        self.backend = None;
    }
}
