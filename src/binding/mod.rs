//! Binding orchestrator
//!
//! One [`Binding`] owns one URL-fetch session: it resolves a transport from
//! the scheme registry, installs the notification funnel as that handler's
//! callback target, and runs the session state machine while guaranteeing
//! strict in-order delivery to the caller's sink.
//!
//! ## Threading model
//!
//! The thread that calls [`Binding::start`] becomes the owner. Every sink
//! call happens on that thread: notifications arriving there while nothing
//! is mid-dispatch are delivered inline, everything else is copied into the
//! task queue and drained by [`Binding::pump`] after the configured
//! [`QueueWaker`] fires. Transports may report from any thread at any time.
//!
//! ## Key components
//!
//! - [`Binding`] - public handle; thin clone-free wrapper over the shared
//!   inner allocation
//! - [`BindOptions`] - engine knobs and collaborator registries
//! - [`BindConfig`] - caller's request configuration, passed through to the
//!   transport opaquely
//! - [`RedirectPolicy`] - optional veto over automatic redirects

mod funnel;
pub mod queue;
pub mod state;

pub use queue::{DEFAULT_QUEUE_CAPACITY, QueueWaker, Task, TaskQueue, ThreadWaker};
pub use state::BindState;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, ThreadId};

use bon::Builder;
use bytes::BytesMut;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{BindError, Result};
use crate::filter::FilterRegistry;
use crate::observability::Metrics;
use crate::sink::BindSink;
use crate::sniff::{ContentClassifier, DefaultClassifier};
use crate::transport::{
    ReadOutcome, RegistryError, ResumeData, TransportHandler, TransportRegistry,
};

pub const DEFAULT_MAX_REDIRECTS: u32 = 10;

/// Request verb passed through to the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RequestVerb {
    #[default]
    Get,
    Post,
    Put,
    Head,
    Custom(String),
}

/// Caller-supplied request configuration.
///
/// The binding never inspects any of this; it travels to whatever transport
/// ends up serving the request (including every post-redirect handler).
#[derive(Debug, Clone, Default, Builder)]
pub struct BindConfig {
    #[builder(default)]
    pub verb: RequestVerb,
    /// Extra header lines, `Name: value`, newline separated.
    pub extra_headers: Option<String>,
    /// Content type the caller would prefer to receive.
    pub requested_type: Option<String>,
    pub code_page: Option<u32>,
    /// Opaque security descriptor for transports that authenticate.
    pub security_token: Option<bytes::Bytes>,
}

/// May veto an automatic redirect before the binding follows it.
pub trait RedirectPolicy: Send + Sync {
    fn approve(&self, from: &str, to: &str) -> bool;
}

/// Engine configuration and collaborator registries for one binding.
#[derive(Builder)]
pub struct BindOptions {
    #[builder(default = Arc::new(TransportRegistry::with_defaults()))]
    pub transports: Arc<TransportRegistry>,

    #[builder(default = Arc::new(FilterRegistry::new()))]
    pub filters: Arc<FilterRegistry>,

    #[builder(default = {
        let classifier: Arc<dyn ContentClassifier> = Arc::new(DefaultClassifier::new());
        classifier
    })]
    pub classifier: Arc<dyn ContentClassifier>,

    pub redirect_policy: Option<Arc<dyn RedirectPolicy>>,

    /// Sniff the payload and verify the content type before the first data
    /// notification. When off, the transport-proposed type is reported
    /// as-is.
    #[builder(default = true)]
    pub verify_media_type: bool,

    #[builder(default = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    #[builder(default = DEFAULT_MAX_REDIRECTS)]
    pub max_redirects: u32,

    /// Owner-thread wake primitive. Defaults to a fresh [`ThreadWaker`];
    /// callers driving an executor supply their own.
    pub waker: Option<Arc<dyn QueueWaker>>,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// The shared per-session allocation.
///
/// The public [`Binding`], the funnel surface handed to transports, and
/// every queued task all reference this one struct; it is freed when the
/// last reference drops.
pub(crate) struct BindInner {
    pub(crate) id: Uuid,
    pub(crate) options: BindOptions,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) queue: TaskQueue,

    /// Back-reference for handing `Arc<dyn TransportNotify>` to handlers.
    pub(crate) self_ref: Mutex<Weak<BindInner>>,

    pub(crate) url: Mutex<String>,
    pub(crate) sink: Mutex<Option<Arc<dyn BindSink>>>,
    pub(crate) config: Mutex<Option<BindConfig>>,
    pub(crate) handler: Mutex<Option<Arc<dyn TransportHandler>>>,
    pub(crate) state: Mutex<BindState>,

    pub(crate) owner: Mutex<Option<ThreadId>>,
    pub(crate) depth: AtomicU32,

    pub(crate) sniff_buf: Mutex<BytesMut>,
    pub(crate) proposed_type: Mutex<Option<String>>,
    pub(crate) content_type: Mutex<Option<String>>,

    pub(crate) mime_reported: AtomicBool,
    pub(crate) result_reported: AtomicBool,
    pub(crate) data_forwarded: AtomicBool,
    pub(crate) filter_installed: AtomicBool,
    pub(crate) handler_locked: AtomicBool,
    pub(crate) redirects: AtomicU32,
}

impl BindInner {
    pub(crate) fn state_snapshot(&self) -> BindState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies a transition if legal; returns whether it happened.
    pub(crate) fn try_transition(&self, next: BindState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.can_transition(next) {
            *state = next;
            true
        } else {
            false
        }
    }

    pub(crate) fn result_reported(&self) -> bool {
        self.result_reported.load(Ordering::SeqCst)
    }

    pub(crate) fn is_owner_thread(&self) -> bool {
        let owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        *owner == Some(thread::current().id())
    }

    pub(crate) fn sink(&self) -> Option<Arc<dyn BindSink>> {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn TransportHandler>> {
        self.handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn current_url(&self) -> String {
        self.url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn bind_config(&self) -> BindConfig {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default()
    }

    /// Installs a handler as the active one and starts it. Used both by the
    /// initial `start` and by redirect restarts.
    pub(crate) fn activate(
        &self,
        handler: Arc<dyn TransportHandler>,
        url: &str,
    ) -> Result<()> {
        let notify = self
            .notify_target()
            .ok_or(BindError::Allocation("binding already released"))?;
        let config = self.bind_config();
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler.clone());
        handler.start(url, notify, &config)?;
        Ok(())
    }

    /// Serves previously sniffed bytes first, then delegates to the active
    /// handler. Never blocks.
    pub(crate) fn read_bytes(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        let state = self.state_snapshot();
        if state == BindState::Created || state.is_terminal() {
            return Err(BindError::InvalidState { op: "read", state });
        }
        if buf.is_empty() {
            return Ok(ReadOutcome::partial(0));
        }

        let served = {
            let mut sniffed = self
                .sniff_buf
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let n = sniffed.len().min(buf.len());
            if n > 0 {
                let chunk = sniffed.split_to(n);
                buf[..n].copy_from_slice(&chunk);
            }
            n
        };
        if served == buf.len() {
            self.metrics.bytes_delivered(served as u64);
            return Ok(ReadOutcome::filled(served));
        }

        let Some(handler) = self.handler() else {
            return Err(BindError::InvalidState { op: "read", state });
        };
        let outcome = match handler.read(&mut buf[served..]) {
            Ok(outcome) => outcome,
            Err(e) if served > 0 => {
                warn!(binding_id = %self.id, error = %e, "handler read failed after sniffed bytes");
                self.metrics.bytes_delivered(served as u64);
                return Ok(ReadOutcome::partial(served));
            }
            Err(e) => return Err(e.into()),
        };

        let total = served + outcome.bytes;
        self.metrics.bytes_delivered(total as u64);
        if total == buf.len() {
            Ok(ReadOutcome::filled(total))
        } else if outcome.is_eof() {
            Ok(ReadOutcome::eof(total))
        } else {
            Ok(ReadOutcome::partial(total))
        }
    }
}

/// One in-flight URL-fetch session.
pub struct Binding {
    inner: Arc<BindInner>,
}

impl Binding {
    pub fn new(options: BindOptions) -> Self {
        let waker: Arc<dyn QueueWaker> = match &options.waker {
            Some(waker) => Arc::clone(waker),
            None => ThreadWaker::new(),
        };
        let queue = TaskQueue::new(options.queue_capacity, waker);

        let inner = Arc::new(BindInner {
            id: Uuid::new_v4(),
            options,
            metrics: Arc::new(Metrics::new()),
            queue,
            self_ref: Mutex::new(Weak::new()),
            url: Mutex::new(String::new()),
            sink: Mutex::new(None),
            config: Mutex::new(None),
            handler: Mutex::new(None),
            state: Mutex::new(BindState::Created),
            owner: Mutex::new(None),
            depth: AtomicU32::new(0),
            sniff_buf: Mutex::new(BytesMut::new()),
            proposed_type: Mutex::new(None),
            content_type: Mutex::new(None),
            mime_reported: AtomicBool::new(false),
            result_reported: AtomicBool::new(false),
            data_forwarded: AtomicBool::new(false),
            filter_installed: AtomicBool::new(false),
            handler_locked: AtomicBool::new(false),
            redirects: AtomicU32::new(0),
        });
        *inner.self_ref.lock().unwrap_or_else(PoisonError::into_inner) =
            Arc::downgrade(&inner);

        Self { inner }
    }

    /// Begins the fetch. The calling thread becomes the owner; the scheme
    /// registry picks the transport. Side effects are synchronous up to the
    /// point the transport itself goes asynchronous — a fully synchronous
    /// handler will have delivered everything, terminal result included, by
    /// the time this returns.
    pub fn start(
        &self,
        url: &str,
        sink: Arc<dyn BindSink>,
        config: BindConfig,
    ) -> Result<()> {
        let inner = &self.inner;

        let state = inner.state_snapshot();
        if state != BindState::Created {
            return Err(BindError::InvalidState { op: "start", state });
        }

        // Resolve before any side effect so an unknown scheme leaves the
        // binding untouched.
        let handler = inner.options.transports.resolve(url).map_err(|e| match e {
            RegistryError::SchemeNotSupported(scheme) => {
                BindError::SchemeNotSupported(scheme)
            }
        })?;

        *inner.owner.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(thread::current().id());
        *inner.url.lock().unwrap_or_else(PoisonError::into_inner) = url.to_string();
        *inner.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink.clone());
        *inner.config.lock().unwrap_or_else(PoisonError::into_inner) = Some(config);

        if !inner.try_transition(BindState::Active) {
            return Err(BindError::InvalidState {
                op: "start",
                state: inner.state_snapshot(),
            });
        }

        info!(binding_id = %inner.id, url, "binding started");
        sink.on_start_binding();

        if let Err(e) = inner.activate(handler, url) {
            // The handler failed synchronously and may never report; make
            // sure the session still reaches a terminal result.
            warn!(binding_id = %inner.id, error = %e, "transport start failed");
            inner.dispatch(Task::Result(
                crate::sink::ResultCode::Failed,
                e.to_string(),
            ));
            return Err(e);
        }
        Ok(())
    }

    /// Forwards deferred-work data verbatim to the current transport.
    /// Honored until `terminate`, even after the result was reported.
    pub fn resume(&self, data: &ResumeData) -> Result<()> {
        let state = self.inner.state_snapshot();
        if state == BindState::Created || state.is_terminal() {
            return Err(BindError::InvalidState { op: "resume", state });
        }
        let Some(handler) = self.inner.handler() else {
            return Err(BindError::InvalidState { op: "resume", state });
        };
        handler.resume(data)?;
        Ok(())
    }

    /// Cancels the fetch. A no-op (returning success) once the result has
    /// been reported. Callable from any thread; the resulting terminal
    /// notification flows through the normal dispatch path.
    pub fn abort(&self, reason: &str) -> Result<()> {
        let inner = &self.inner;
        if inner.result_reported() {
            return Ok(());
        }

        if !inner.try_transition(BindState::Aborted) {
            return if inner.result_reported() {
                Ok(())
            } else {
                Err(BindError::InvalidState {
                    op: "abort",
                    state: inner.state_snapshot(),
                })
            };
        }

        info!(binding_id = %inner.id, reason, "binding aborted");
        if let Some(handler) = inner.handler() {
            handler.abort(reason)?;
        }
        Ok(())
    }

    /// Releases the transport, sink and configuration. Invalid before the
    /// terminal result has been reported.
    pub fn terminate(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.result_reported() {
            return Err(BindError::InvalidState {
                op: "terminate",
                state: inner.state_snapshot(),
            });
        }
        if !inner.try_transition(BindState::Terminated) {
            return Err(BindError::InvalidState {
                op: "terminate",
                state: inner.state_snapshot(),
            });
        }

        let handler = inner
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handler) = handler {
            if inner.handler_locked.swap(false, Ordering::SeqCst) {
                handler.unlock();
            }
            handler.terminate();
        }
        *inner.sink.lock().unwrap_or_else(PoisonError::into_inner) = None;
        *inner.config.lock().unwrap_or_else(PoisonError::into_inner) = None;
        inner.queue.clear();

        info!(binding_id = %inner.id, "binding terminated");
        Ok(())
    }

    /// Reads available payload bytes without blocking. A `Partial` outcome
    /// with fewer bytes than requested is normal operation, not an error.
    pub fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        self.inner.read_bytes(buf)
    }

    /// Drains deferred notifications in FIFO order. Must be called from the
    /// owner thread; calls from anywhere else are ignored. Returns the
    /// number of tasks executed.
    pub fn pump(&self) -> usize {
        self.inner.pump()
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn state(&self) -> BindState {
        self.inner.state_snapshot()
    }

    /// The verified content type, once reported.
    pub fn content_type(&self) -> Option<String> {
        self.inner
            .content_type
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// True once the terminal result has reached the sink.
    pub fn is_complete(&self) -> bool {
        self.inner.result_reported()
    }

    /// True while deferred notifications are waiting for a `pump`.
    pub fn has_pending_tasks(&self) -> bool {
        !self.inner.queue.is_empty()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }
}
