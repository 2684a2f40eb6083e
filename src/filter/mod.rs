//! Content-based data filters
//!
//! Once the sniffed content type is known, the funnel consults the
//! [`FilterRegistry`]; on a match it wraps the active transport in a
//! [`FilterHandler`] and swaps the binding's handler reference to the
//! wrapper. From then on every byte the caller reads has passed through the
//! filter, while raw notifications keep flowing from the wrapped transport
//! untouched.
//!
//! Filters see the payload exactly once: the already-sniffed prefix is fed
//! in at insertion, the rest streams through `read`.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::binding::BindConfig;
use crate::sniff::normalize;
use crate::transport::{
    ReadOutcome, ReadStatus, Result, ResumeData, TransportError, TransportHandler,
    TransportNotify,
};

/// Streaming byte transformer.
///
/// `transform` may buffer internally and emit nothing for a given input;
/// `finish` flushes whatever is held back once the upstream is exhausted.
pub trait DataFilter: Send {
    fn transform(&mut self, input: &[u8], output: &mut BytesMut);

    fn finish(&mut self, _output: &mut BytesMut) {}
}

/// Passes bytes through untouched. Useful as a placeholder registration
/// when only the insertion mechanics matter.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityFilter;

impl DataFilter for IdentityFilter {
    fn transform(&mut self, input: &[u8], output: &mut BytesMut) {
        output.extend_from_slice(input);
    }
}

pub trait FilterFactory: Send + Sync {
    fn create(&self) -> Box<dyn DataFilter>;
}

impl<F> FilterFactory for F
where
    F: Fn() -> Box<dyn DataFilter> + Send + Sync,
{
    fn create(&self) -> Box<dyn DataFilter> {
        self()
    }
}

/// Registry mapping content types to filter factories. Lookup keys are
/// normalized (lowercase, parameters stripped), so registering
/// `text/plain` also matches `Text/Plain; charset=utf-8`.
pub struct FilterRegistry {
    factories: BTreeMap<String, Arc<dyn FilterFactory>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self { factories: BTreeMap::new() }
    }

    pub fn register(
        &mut self,
        content_type: impl AsRef<str>,
        factory: impl FilterFactory + 'static,
    ) {
        self.factories
            .insert(normalize(content_type.as_ref()), Arc::new(factory));
    }

    pub fn matches(&self, content_type: &str) -> bool {
        self.factories.contains_key(&normalize(content_type))
    }

    pub fn create(&self, content_type: &str) -> Option<Box<dyn DataFilter>> {
        self.factories
            .get(&normalize(content_type))
            .map(|f| f.create())
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport-compatible decorator that runs payload bytes through a
/// [`DataFilter`].
///
/// The wrapped handler keeps its original notification target; only the
/// read path is intercepted. `start` consumes the prelude (the bytes the
/// funnel had already sniffed off the raw stream), so the transformed
/// stream observed downstream equals `filter(raw_bytes)` end to end.
pub struct FilterHandler {
    inner: Arc<dyn TransportHandler>,
    filter: Mutex<Box<dyn DataFilter>>,
    prelude: Mutex<Option<Bytes>>,
    /// Transformed bytes not yet handed to the reader.
    pending: Mutex<BytesMut>,
    /// Wrapped handler hit EOF and the filter has been flushed.
    drained: AtomicBool,
}

impl FilterHandler {
    pub fn new(
        inner: Arc<dyn TransportHandler>,
        filter: Box<dyn DataFilter>,
        prelude: Bytes,
    ) -> Self {
        Self {
            inner,
            filter: Mutex::new(filter),
            prelude: Mutex::new(Some(prelude)),
            pending: Mutex::new(BytesMut::new()),
            drained: AtomicBool::new(false),
        }
    }

    /// Pulls one round of raw bytes from the wrapped handler through the
    /// filter into `pending`. Returns false when nothing more can be
    /// produced right now.
    fn refill(&self) -> Result<bool> {
        if self.drained.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let mut raw = [0u8; 8192];
        let outcome = self.inner.read(&mut raw)?;

        let mut filter = self
            .filter
            .lock()
            .map_err(|_| TransportError::Failed("filter poisoned".to_string()))?;
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| TransportError::Failed("filter buffer poisoned".to_string()))?;

        if outcome.bytes > 0 {
            filter.transform(&raw[..outcome.bytes], &mut pending);
        }
        if outcome.is_eof() {
            filter.finish(&mut pending);
            self.drained.store(true, Ordering::SeqCst);
        }

        Ok(outcome.bytes > 0 || outcome.is_eof())
    }
}

impl TransportHandler for FilterHandler {
    /// Feeds the prelude through the filter. The wrapped transport was
    /// already started by the binding; `notify` stays unused because raw
    /// notifications keep flowing from the wrapped handler.
    fn start(
        &self,
        url: &str,
        _notify: Arc<dyn TransportNotify>,
        _config: &BindConfig,
    ) -> Result<()> {
        let prelude = self
            .prelude
            .lock()
            .map_err(|_| TransportError::Failed("filter prelude poisoned".to_string()))?
            .take();

        if let Some(bytes) = prelude {
            debug!(url, prelude = bytes.len(), "filter consuming sniffed prefix");
            let mut filter = self
                .filter
                .lock()
                .map_err(|_| TransportError::Failed("filter poisoned".to_string()))?;
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| TransportError::Failed("filter buffer poisoned".to_string()))?;
            filter.transform(&bytes, &mut pending);
        }
        Ok(())
    }

    fn resume(&self, data: &ResumeData) -> Result<()> {
        self.inner.resume(data)
    }

    fn abort(&self, reason: &str) -> Result<()> {
        self.inner.abort(reason)
    }

    fn terminate(&self) {
        self.inner.terminate();
    }

    fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        if buf.is_empty() {
            return Ok(ReadOutcome::partial(0));
        }
        let mut written = 0;

        loop {
            {
                let mut pending = self.pending.lock().map_err(|_| {
                    TransportError::Failed("filter buffer poisoned".to_string())
                })?;
                let n = pending.len().min(buf.len() - written);
                if n > 0 {
                    let chunk = pending.split_to(n);
                    buf[written..written + n].copy_from_slice(&chunk);
                    written += n;
                }
            }

            if written == buf.len() && !buf.is_empty() {
                return Ok(ReadOutcome::filled(written));
            }

            match self.refill() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    if written > 0 {
                        return Ok(ReadOutcome::partial(written));
                    }
                    return Err(e);
                }
            }
        }

        let pending_empty = self
            .pending
            .lock()
            .map(|p| p.is_empty())
            .unwrap_or(true);
        if self.drained.load(Ordering::SeqCst) && pending_empty && written == 0 {
            Ok(ReadOutcome::eof(0))
        } else if self.drained.load(Ordering::SeqCst) && pending_empty {
            Ok(ReadOutcome { bytes: written, status: ReadStatus::Eof })
        } else {
            Ok(ReadOutcome::partial(written))
        }
    }

    fn lock(&self) {
        self.inner.lock();
    }

    fn unlock(&self) {
        self.inner.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::ResultCode;

    /// Upper-cases ASCII; holds back nothing.
    struct UpcaseFilter;

    impl DataFilter for UpcaseFilter {
        fn transform(&mut self, input: &[u8], output: &mut BytesMut) {
            output.extend(input.iter().map(|b| b.to_ascii_uppercase()));
        }
    }

    /// Minimal in-memory transport serving a fixed byte string.
    struct StaticTransport {
        data: Mutex<Bytes>,
    }

    impl StaticTransport {
        fn new(data: &[u8]) -> Self {
            Self { data: Mutex::new(Bytes::copy_from_slice(data)) }
        }
    }

    impl TransportHandler for StaticTransport {
        fn start(
            &self,
            _url: &str,
            _notify: Arc<dyn TransportNotify>,
            _config: &BindConfig,
        ) -> Result<()> {
            Ok(())
        }

        fn abort(&self, _reason: &str) -> Result<()> {
            Ok(())
        }

        fn terminate(&self) {}

        fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
            let mut data = self.data.lock().unwrap();
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data.split_to(n));
            if n == 0 {
                Ok(ReadOutcome::eof(0))
            } else if n == buf.len() {
                Ok(ReadOutcome::filled(n))
            } else {
                Ok(ReadOutcome::partial(n))
            }
        }
    }

    struct NullNotify;

    impl TransportNotify for NullNotify {
        fn on_resume_needed(&self, _data: ResumeData) {}
        fn on_progress(&self, _code: crate::sink::ProgressCode, _text: &str) {}
        fn on_data(&self, _flags: crate::sink::DataFlags, _progress: u64, _max: u64) {}
        fn on_result(&self, _code: ResultCode, _text: &str) {}
    }

    #[test]
    fn test_registry_normalizes_keys() {
        let mut registry = FilterRegistry::new();
        registry.register("Text/Plain", || -> Box<dyn DataFilter> {
            Box::new(IdentityFilter)
        });

        assert!(registry.matches("text/plain"));
        assert!(registry.matches("text/plain; charset=utf-8"));
        assert!(!registry.matches("text/html"));
        assert!(registry.create("TEXT/PLAIN").is_some());
    }

    #[test]
    fn test_filter_handler_transforms_prelude_and_stream() {
        let inner = Arc::new(StaticTransport::new(b" tail of the stream"));
        let handler = FilterHandler::new(
            inner,
            Box::new(UpcaseFilter),
            Bytes::from_static(b"sniffed head"),
        );
        handler
            .start("test://x", Arc::new(NullNotify), &BindConfig::default())
            .unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let outcome = handler.read(&mut buf).unwrap();
            out.extend_from_slice(&buf[..outcome.bytes]);
            if outcome.is_eof() {
                break;
            }
        }
        assert_eq!(out, b"SNIFFED HEAD TAIL OF THE STREAM");
    }

    #[test]
    fn test_filter_finish_flushes_held_bytes() {
        /// Holds everything until finish.
        struct HoldAll {
            held: Vec<u8>,
        }

        impl DataFilter for HoldAll {
            fn transform(&mut self, input: &[u8], _output: &mut BytesMut) {
                self.held.extend_from_slice(input);
            }

            fn finish(&mut self, output: &mut BytesMut) {
                output.extend_from_slice(&self.held);
            }
        }

        let inner = Arc::new(StaticTransport::new(b"abc"));
        let handler =
            FilterHandler::new(inner, Box::new(HoldAll { held: Vec::new() }), Bytes::new());
        handler
            .start("test://x", Arc::new(NullNotify), &BindConfig::default())
            .unwrap();

        let mut buf = [0u8; 16];
        let outcome = handler.read(&mut buf).unwrap();
        assert_eq!(&buf[..outcome.bytes], b"abc");
        assert_eq!(outcome.status, ReadStatus::Eof);
    }
}
