//! Notification funnel
//!
//! Every raw transport notification lands here. The funnel decides between
//! inline dispatch and queueing, interposes content sniffing and filter
//! insertion on the data path, enforces the single-result latch, and turns
//! redirect results into a silent handler swap plus restart.
//!
//! Inline dispatch is legal only when the call is already on the owner
//! thread, nothing is mid-dispatch, and the queue is empty — any weaker
//! rule could reorder notifications around queued ones.

use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};

use super::queue::{QueueFull, Task};
use super::state::BindState;
use super::BindInner;
use crate::error::BindError;
use crate::filter::FilterHandler;
use crate::sink::{DataFlags, DataSource, ProgressCode, ResultCode};
use crate::sniff::{normalize, SNIFF_WINDOW};
use crate::transport::{ReadStatus, ResumeData, TransportHandler, TransportNotify};

/// Pull-style payload view handed to the sink during a data notification.
struct BindingData<'a> {
    inner: &'a BindInner,
}

impl DataSource for BindingData<'_> {
    fn read(&self, buf: &mut [u8]) -> crate::error::Result<crate::transport::ReadOutcome> {
        self.inner.read_bytes(buf)
    }
}

enum SniffProgress {
    /// Type resolved; the triggering notification may be forwarded.
    Ready,
    /// Below the sniff window with more data expected; hold this one.
    NeedMore,
    /// The handler failed mid-sniff; its own terminal result will follow.
    Broken,
}

impl TransportNotify for BindInner {
    fn on_resume_needed(&self, data: ResumeData) {
        self.dispatch(Task::Resume(data));
    }

    fn on_progress(&self, code: ProgressCode, text: &str) {
        // The transport-proposed type is classifier input, never a sink
        // notification of its own.
        if code == ProgressCode::SuggestedContentType {
            trace!(binding_id = %self.id, proposed = text, "transport proposed type");
            *self
                .proposed_type
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(text.to_string());
            return;
        }
        self.dispatch(Task::Progress(code, text.to_string()));
    }

    fn on_data(&self, flags: DataFlags, progress: u64, max: u64) {
        self.dispatch(Task::DataReady(flags, progress, max));
    }

    fn on_result(&self, code: ResultCode, text: &str) {
        self.dispatch(Task::Result(code, text.to_string()));
    }
}

impl BindInner {
    /// Routes one notification: inline when safe, queued otherwise.
    pub(crate) fn dispatch(&self, task: Task) {
        if self.direct_dispatch_allowed() {
            trace!(binding_id = %self.id, kind = task.kind(), "direct dispatch");
            self.metrics.direct_dispatch();
            self.run_task(task);
            // Anything that queued behind the inline dispatch runs now,
            // still on the owner thread, still in order.
            self.pump();
        } else {
            match self.queue.push(task) {
                Ok(()) => self.metrics.task_queued(),
                Err(e) => self.recover_overflow(e),
            }
        }
    }

    fn direct_dispatch_allowed(&self) -> bool {
        self.is_owner_thread()
            && self.depth.load(Ordering::SeqCst) == 0
            && self.queue.is_empty()
    }

    /// FIFO drain; owner thread only.
    pub(crate) fn pump(&self) -> usize {
        if !self.is_owner_thread() {
            warn!(binding_id = %self.id, "pump called off the owner thread; ignored");
            return 0;
        }
        let mut drained = 0;
        while let Some(task) = self.queue.pop() {
            self.run_task(task);
            drained += 1;
        }
        drained
    }

    fn run_task(&self, task: Task) {
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.execute(task);
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }

    fn execute(&self, task: Task) {
        match task {
            Task::Resume(data) => {
                // Honored until terminate, result or not.
                if self.state_snapshot().is_terminal() {
                    return;
                }
                if let Some(handler) = self.handler() {
                    if let Err(e) = handler.resume(&data) {
                        warn!(binding_id = %self.id, error = %e, "resume failed");
                    }
                }
            }
            Task::Progress(code, text) => {
                if !self.delivering() {
                    return;
                }
                if let Some(sink) = self.sink() {
                    sink.on_progress(0, 0, code, &text);
                }
            }
            Task::DataReady(flags, progress, max) => {
                if !self.delivering() {
                    return;
                }
                self.deliver_data(flags, progress, max);
            }
            Task::Result(code, text) => self.deliver_result(code, &text),
        }
    }

    /// Data and progress flow only while the session is live and the result
    /// latch is clear.
    fn delivering(&self) -> bool {
        !self.result_reported() && self.state_snapshot().delivers_payload()
    }

    fn deliver_data(&self, flags: DataFlags, progress: u64, max: u64) {
        if !self.mime_reported.load(Ordering::SeqCst) {
            match self.resolve_content_type() {
                SniffProgress::Ready => {}
                SniffProgress::NeedMore | SniffProgress::Broken => return,
            }
        }

        // Hold the transport's data alive across a later terminate until
        // the caller is done reading.
        if !self.handler_locked.swap(true, Ordering::SeqCst) {
            if let Some(handler) = self.handler() {
                handler.lock();
            }
        }

        let mut flags = flags;
        if !self.data_forwarded.swap(true, Ordering::SeqCst) {
            // Sniffing may have swallowed the notification that carried
            // FIRST; reinstate it on the first one the sink actually sees.
            flags |= DataFlags::FIRST;
            flags.remove(DataFlags::INTERMEDIATE);
        }

        if let Some(sink) = self.sink() {
            sink.on_data_available(flags, progress, max, &BindingData { inner: self });
        }
    }

    /// Runs the sniffing algorithm up to the point the content type is
    /// final, inserting a filter when one is registered for it.
    fn resolve_content_type(&self) -> SniffProgress {
        let url = self.current_url();
        let proposed = self
            .proposed_type
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mime = if self.options.verify_media_type {
            let Some(handler) = self.handler() else {
                return SniffProgress::Broken;
            };

            // Accumulate the sniff window from the raw stream.
            loop {
                let have = self
                    .sniff_buf
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .len();
                if have >= SNIFF_WINDOW {
                    break;
                }

                let mut chunk = [0u8; SNIFF_WINDOW];
                let want = SNIFF_WINDOW - have;
                let outcome = match handler.read(&mut chunk[..want]) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(binding_id = %self.id, error = %e, "read failed while sniffing");
                        return SniffProgress::Broken;
                    }
                };

                if outcome.bytes > 0 {
                    self.sniff_buf
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend_from_slice(&chunk[..outcome.bytes]);
                }
                match outcome.status {
                    ReadStatus::Eof => break,
                    _ if outcome.bytes == 0 => return SniffProgress::NeedMore,
                    _ => {}
                }
            }

            let data = self
                .sniff_buf
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .to_vec();
            self.options
                .classifier
                .classify(&data, proposed.as_deref(), &url)
        } else {
            proposed
                .as_deref()
                .map(normalize)
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string())
        };

        self.maybe_install_filter(&mime, &url);

        *self
            .content_type
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(mime.clone());

        if !self.mime_reported.swap(true, Ordering::SeqCst) {
            self.metrics.sniff_completed();
            info!(binding_id = %self.id, content_type = %mime, "content type resolved");
            if let Some(sink) = self.sink() {
                sink.on_progress(0, 0, ProgressCode::ContentTypeAvailable, &mime);
            }
        }
        SniffProgress::Ready
    }

    /// Wraps the active handler in a filter when one is registered for the
    /// resolved type, handing the already-sniffed prefix over so the filter
    /// sees the payload from byte zero.
    fn maybe_install_filter(&self, mime: &str, url: &str) {
        if self.filter_installed.load(Ordering::SeqCst) {
            return;
        }
        let Some(filter) = self.options.filters.create(mime) else {
            return;
        };
        let Some(current) = self.handler() else {
            return;
        };
        let Some(notify) = self.notify_target() else {
            return;
        };

        let prelude: Bytes = self
            .sniff_buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .split()
            .freeze();

        debug!(
            binding_id = %self.id,
            content_type = mime,
            prelude = prelude.len(),
            "installing data filter"
        );

        let wrapper = Arc::new(FilterHandler::new(current, filter, prelude));
        if let Err(e) = wrapper.start(url, notify, &self.bind_config()) {
            warn!(binding_id = %self.id, error = %e, "filter start failed; continuing unfiltered");
            return;
        }

        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(wrapper);
        self.filter_installed.store(true, Ordering::SeqCst);
        self.metrics.filter_installed();
    }

    fn deliver_result(&self, code: ResultCode, text: &str) {
        if code.is_redirect() {
            self.follow_redirect(text);
            return;
        }

        if self.result_reported.swap(true, Ordering::SeqCst) {
            debug!(binding_id = %self.id, ?code, "duplicate terminal result dropped");
            return;
        }

        // Aborted keeps its state; the latch alone gates delivery there.
        self.try_transition(BindState::ResultReported);

        self.metrics.result_delivered();
        info!(binding_id = %self.id, ?code, text, "binding result");
        if let Some(sink) = self.sink() {
            sink.on_stop_binding(code, text);
        }
    }

    /// Tears down the current handler and restarts against the redirect
    /// target. The sink never hears about the discarded handler.
    fn follow_redirect(&self, target: &str) {
        if self.result_reported() {
            return;
        }
        let from = self.current_url();

        let hops = self.redirects.fetch_add(1, Ordering::SeqCst) + 1;
        if hops > self.options.max_redirects {
            let err = BindError::RedirectRejected(format!(
                "redirect limit ({}) exceeded at {target}",
                self.options.max_redirects
            ));
            warn!(binding_id = %self.id, from, target, "redirect limit exceeded");
            self.deliver_result(ResultCode::Failed, &err.to_string());
            return;
        }

        if let Some(policy) = &self.options.redirect_policy {
            if !policy.approve(&from, target) {
                let err =
                    BindError::RedirectRejected(format!("vetoed by policy: {target}"));
                info!(binding_id = %self.id, from, target, "redirect vetoed");
                self.deliver_result(ResultCode::Failed, &err.to_string());
                return;
            }
        }

        if !self.try_transition(BindState::Redirecting) {
            // Aborted (or already resolved) while the redirect was queued.
            return;
        }

        // Silent teardown of the handler being discarded.
        let old = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(old) = old {
            if self.handler_locked.swap(false, Ordering::SeqCst) {
                old.unlock();
            }
            old.terminate();
        }

        // Fresh transfer, fresh sniff state. The one-shot mime latch stays:
        // a type already reported to the sink is never reported again.
        self.sniff_buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *self
            .proposed_type
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        *self.url.lock().unwrap_or_else(PoisonError::into_inner) = target.to_string();

        self.metrics.redirect_followed();
        info!(binding_id = %self.id, from, to = target, "following redirect");

        if !self.try_transition(BindState::Active) {
            return;
        }

        let handler = match self.options.transports.resolve(target) {
            Ok(handler) => handler,
            Err(e) => {
                self.deliver_result(ResultCode::Failed, &e.to_string());
                return;
            }
        };
        if let Err(e) = self.activate(handler, target) {
            self.deliver_result(ResultCode::Failed, &e.to_string());
        }
    }

    /// A full queue is the engine's recoverable allocation failure: force
    /// an abort and wedge a synthesized terminal result in so the binding
    /// can never be left stuck.
    fn recover_overflow(&self, err: QueueFull) {
        error!(binding_id = %self.id, %err, "forcing abort");
        self.metrics.queue_overflow();

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.delivers_payload() {
                *state = BindState::Aborted;
            }
        }
        if let Some(handler) = self.handler() {
            let _ = handler.abort("notification queue overflow");
        }

        let text = BindError::Allocation("notification queue full").to_string();
        self.queue.push_forced(Task::Result(ResultCode::Failed, text));
    }

    pub(crate) fn notify_target(&self) -> Option<Arc<dyn TransportNotify>> {
        let weak = self
            .self_ref
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match weak.upgrade() {
            Some(inner) => {
                let notify: Arc<dyn TransportNotify> = inner;
                Some(notify)
            }
            None => None,
        }
    }
}
