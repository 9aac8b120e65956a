//! Shared ownership of a codec backend.
//!
//! [`CodecHandle`] wraps the backend in a reader/writer lock: buffer I/O
//! takes the read lock so the manager and the driver callback can overlap,
//! lifecycle transitions take the write lock so they observe no in-flight
//! I/O. A handle with no installed backend (not yet initialized, or already
//! released) answers every call with [`CodecError::NotInitialized`].

use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;

use crate::backend::{ActivityNotify, CodecBackend, CodecConfig, OutputBuffer, OutputFormat};
use crate::error::{CodecError, CodecStatus};
use crate::sample::ImageHandle;
use crate::slots::BufferSlot;

pub struct CodecHandle {
    inner: RwLock<Option<Box<dyn CodecBackend>>>,
}

impl CodecHandle {
    /// An empty handle; every operation fails with `NotInitialized` until
    /// [`install`](Self::install) succeeds.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    /// Installs a backend and runs `allocate` on it. On allocation failure
    /// the handle stays empty.
    pub fn install(&self, mut backend: Box<dyn CodecBackend>) -> CodecStatus<()> {
        let mut guard = self.inner.write();
        backend.allocate()?;
        *guard = Some(backend);
        Ok(())
    }

    pub fn is_installed(&self) -> bool {
        self.inner.read().is_some()
    }

    fn with_read<T>(
        &self,
        f: impl FnOnce(&dyn CodecBackend) -> CodecStatus<T>,
    ) -> CodecStatus<T> {
        match self.inner.read().as_deref() {
            Some(backend) => f(backend),
            None => Err(CodecError::NotInitialized),
        }
    }

    fn with_write<T>(
        &self,
        f: impl FnOnce(&mut dyn CodecBackend) -> CodecStatus<T>,
    ) -> CodecStatus<T> {
        match self.inner.write().as_deref_mut() {
            Some(backend) => f(backend),
            None => Err(CodecError::NotInitialized),
        }
    }

    // --- lifecycle (write lock) ---

    pub fn configure(&self, config: &CodecConfig) -> CodecStatus<()> {
        self.with_write(|b| b.configure(config))
    }

    pub fn start(&self) -> CodecStatus<()> {
        self.with_write(|b| b.start())
    }

    pub fn stop(&self) -> CodecStatus<()> {
        self.with_write(|b| b.stop())
    }

    pub fn flush(&self) -> CodecStatus<()> {
        self.with_write(|b| b.flush())
    }

    /// Releases the backend. Ops after this report `NotInitialized`;
    /// releasing an empty handle is a no-op.
    pub fn release(&self) {
        let mut guard = self.inner.write();
        if let Some(mut backend) = guard.take() {
            if let Err(err) = backend.release() {
                debug!(%err, "codec release reported an error");
            }
        }
    }

    // --- buffer I/O (read lock) ---

    pub fn dequeue_input(&self, timeout: Duration) -> CodecStatus<BufferSlot> {
        self.with_read(|b| b.dequeue_input(timeout))
    }

    pub fn enqueue_input(
        &self,
        slot: BufferSlot,
        payload: &[u8],
        time_us: i64,
        flags: u32,
    ) -> CodecStatus<()> {
        self.with_read(|b| b.enqueue_input(slot, payload, time_us, flags))
    }

    /// Dequeues an input slot and submits `payload` through it in one step.
    /// `WouldBlock` from the dequeue passes through untouched so callers can
    /// retry the whole submission.
    pub fn submit(
        &self,
        payload: &[u8],
        time_us: i64,
        flags: u32,
        timeout: Duration,
    ) -> CodecStatus<()> {
        self.with_read(|b| {
            let slot = b.dequeue_input(timeout)?;
            b.enqueue_input(slot, payload, time_us, flags)
        })
    }

    pub fn dequeue_output(&self, timeout: Duration) -> CodecStatus<OutputBuffer> {
        self.with_read(|b| b.dequeue_output(timeout))
    }

    pub fn output_data(&self, slot: BufferSlot) -> CodecStatus<Bytes> {
        self.with_read(|b| b.output_data(slot))
    }

    pub fn output_image(&self, slot: BufferSlot) -> CodecStatus<Option<ImageHandle>> {
        self.with_read(|b| b.output_image(slot))
    }

    pub fn release_output(&self, slot: BufferSlot) -> CodecStatus<()> {
        self.with_read(|b| b.release_output(slot))
    }

    pub fn output_format(&self) -> CodecStatus<OutputFormat> {
        self.with_read(|b| b.output_format())
    }

    pub fn request_activity_notification(&self, notify: ActivityNotify) -> CodecStatus<()> {
        self.with_read(|b| {
            b.request_activity_notification(notify);
            Ok(())
        })
    }
}

impl Default for CodecHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockCodec;
    use crate::sample::AudioFormat;

    fn stereo() -> AudioFormat {
        AudioFormat {
            channels: 2,
            sample_rate: 44_100,
        }
    }

    #[test]
    fn empty_handle_reports_not_initialized() {
        let handle = CodecHandle::new();
        assert!(matches!(
            handle.dequeue_input(Duration::ZERO),
            Err(CodecError::NotInitialized)
        ));
        assert!(matches!(handle.start(), Err(CodecError::NotInitialized)));
        handle.release(); // no-op
    }

    #[test]
    fn install_start_submit() {
        let (codec, probe) = MockCodec::audio(stereo());
        let handle = CodecHandle::new();
        handle.install(Box::new(codec)).unwrap();
        handle
            .configure(&CodecConfig::audio("audio/mp4a-latm", stereo()))
            .unwrap();
        handle.start().unwrap();

        handle.submit(b"abcd", 500, 0, Duration::ZERO).unwrap();
        let out = handle.dequeue_output(Duration::ZERO).unwrap();
        assert_eq!(out.time_us, 500);
        handle.release_output(out.slot).unwrap();

        handle.release();
        assert!(probe.released());
        assert!(matches!(
            handle.dequeue_output(Duration::ZERO),
            Err(CodecError::NotInitialized)
        ));
    }
}
