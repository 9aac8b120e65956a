//! Asynchronous reservation of scarce decoder hardware.
//!
//! Hardware video decoder instances are a finite resource on most SoCs;
//! audio decoders are effectively unlimited. [`ResourceBroker`] serializes
//! reservation requests on its own thread and answers each one through a
//! callback, so callers never block while the broker decides. A granted
//! reservation is carried by a [`ReservationToken`] that returns the unit
//! to the pool when released or dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    AudioDecoder,
    VideoDecoder,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AudioDecoder => "audio-decoder",
            Self::VideoDecoder => "video-decoder",
        }
    }
}

/// Pool sizes. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrokerLimits {
    pub video_decoders: Option<usize>,
}

/// Invoked exactly once with the outcome of a reservation request.
pub type GrantCallback = Box<dyn FnOnce(Result<ReservationToken, DecodeError>) + Send>;

enum BrokerRequest {
    Reserve {
        kind: ResourceKind,
        callback: GrantCallback,
    },
    Release(ResourceKind),
    Shutdown,
}

struct Pool {
    limits: BrokerLimits,
    video_in_use: usize,
}

impl Pool {
    fn try_take(&mut self, kind: ResourceKind) -> bool {
        match kind {
            ResourceKind::AudioDecoder => true,
            ResourceKind::VideoDecoder => match self.limits.video_decoders {
                Some(limit) if self.video_in_use >= limit => false,
                _ => {
                    self.video_in_use += 1;
                    true
                }
            },
        }
    }

    fn put_back(&mut self, kind: ResourceKind) {
        if kind == ResourceKind::VideoDecoder {
            self.video_in_use = self.video_in_use.saturating_sub(1);
        }
    }
}

pub struct ResourceBroker {
    tx: Sender<BrokerRequest>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceBroker {
    pub fn new(limits: BrokerLimits) -> Arc<Self> {
        let (tx, rx) = unbounded();
        let worker = thread::Builder::new()
            .name("hwdec-broker".into())
            .spawn(move || {
                let mut pool = Pool {
                    limits,
                    video_in_use: 0,
                };
                for request in rx.iter() {
                    match request {
                        BrokerRequest::Reserve { kind, callback } => {
                            if pool.try_take(kind) {
                                debug!(kind = kind.as_str(), "reservation granted");
                                callback(Ok(ReservationToken::granted(kind)));
                            } else {
                                debug!(kind = kind.as_str(), "reservation denied");
                                callback(Err(DecodeError::ReservationDenied));
                            }
                        }
                        BrokerRequest::Release(kind) => pool.put_back(kind),
                        BrokerRequest::Shutdown => break,
                    }
                }
                // Deny anything still queued behind the shutdown request.
                for request in rx.try_iter() {
                    if let BrokerRequest::Reserve { callback, .. } = request {
                        callback(Err(DecodeError::ReservationDenied));
                    }
                }
            })
            .ok();
        if worker.is_none() {
            warn!("failed to spawn broker thread; all reservations will be denied");
        }
        Arc::new(Self {
            tx,
            worker: Mutex::new(worker),
        })
    }

    /// A broker with no pool limits; every request is granted.
    pub fn unlimited() -> Arc<Self> {
        Self::new(BrokerLimits::default())
    }

    /// Requests one unit of `kind`. The callback fires on the broker thread
    /// with either a token or [`DecodeError::ReservationDenied`]; callers
    /// should hand the outcome off to their own thread rather than do real
    /// work in it.
    pub fn reserve(self: &Arc<Self>, kind: ResourceKind, callback: GrantCallback) {
        let broker = Arc::downgrade(self);
        let wired: GrantCallback = Box::new(move |outcome| {
            let outcome = outcome.map(|mut token| {
                token.wire(broker);
                token
            });
            callback(outcome);
        });
        if let Err(err) = self.tx.send(BrokerRequest::Reserve {
            kind,
            callback: wired,
        }) {
            // Broker already shut down; the caller is still owed an answer.
            if let BrokerRequest::Reserve { callback, .. } = err.into_inner() {
                callback(Err(DecodeError::ReservationDenied));
            }
        }
    }

    fn release(&self, kind: ResourceKind) {
        let _ = self.tx.send(BrokerRequest::Release(kind));
    }

    /// Stops the broker thread. Requests queued behind the stop are denied;
    /// tokens released afterwards are silently dropped.
    pub fn shutdown(&self) {
        let _ = self.tx.send(BrokerRequest::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for ResourceBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Proof of a granted reservation. Releases its unit back to the pool on
/// [`release`](Self::release) or drop, whichever comes first.
pub struct ReservationToken {
    kind: ResourceKind,
    broker: std::sync::Weak<ResourceBroker>,
    released: AtomicBool,
}

impl ReservationToken {
    fn granted(kind: ResourceKind) -> Self {
        Self {
            kind,
            broker: std::sync::Weak::new(),
            released: AtomicBool::new(false),
        }
    }

    fn wire(&mut self, broker: std::sync::Weak<ResourceBroker>) {
        self.broker = broker;
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Returns the unit to the pool. Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(broker) = self.broker.upgrade() {
            broker.release(self.kind);
        }
    }
}

impl Drop for ReservationToken {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ReservationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationToken")
            .field("kind", &self.kind.as_str())
            .field("released", &self.released.load(Ordering::Acquire))
            .finish()
    }
}
