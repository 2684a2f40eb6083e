//! Transport handler contract and scheme resolution
//!
//! A transport handler is the per-scheme capability that performs the actual
//! retrieval. The binding treats every handler uniformly through
//! [`TransportHandler`] and receives raw notifications through the
//! [`TransportNotify`] target installed at `start` — handlers may invoke
//! that target from any thread, at any time.
//!
//! ## Key components
//!
//! - [`TransportHandler`] - capability set `{start, resume, abort,
//!   terminate, read, lock, unlock}`
//! - [`TransportNotify`] - raw notification target (implemented by the
//!   binding's funnel)
//! - [`TransportRegistry`] - scheme → factory table consulted at `start`
//! - [`FileTransport`] / [`HttpTransport`] - shipped scheme adapters

mod file;
mod http;

pub use file::FileTransport;
pub use http::{HttpConfig, HttpTransport};

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::binding::BindConfig;
use crate::sink::{DataFlags, ProgressCode, ResultCode};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    Denied(String),

    #[error("request failed: {0}")]
    Failed(String),

    #[error("handler already terminated")]
    Terminated,
}

impl TransportError {
    pub fn result_code(&self) -> ResultCode {
        match self {
            TransportError::NotFound(_) => ResultCode::NotFound,
            TransportError::Denied(_) => ResultCode::Denied,
            TransportError::Failed(_) | TransportError::Terminated => ResultCode::Failed,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Opaque payload a handler hands back when it defers work that must be
/// resumed from the owner thread. The engine copies it into the task queue
/// and returns it verbatim through [`TransportHandler::resume`].
pub type ResumeData = Bytes;

/// How a non-blocking read ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The caller's buffer was filled completely.
    Filled,
    /// Fewer bytes than requested were available right now. Not an error;
    /// more data may arrive later.
    Partial,
    /// The stream is exhausted; no further bytes will ever be produced.
    Eof,
}

/// Byte count plus status for a single read call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub bytes: usize,
    pub status: ReadStatus,
}

impl ReadOutcome {
    pub fn filled(bytes: usize) -> Self {
        Self { bytes, status: ReadStatus::Filled }
    }

    pub fn partial(bytes: usize) -> Self {
        Self { bytes, status: ReadStatus::Partial }
    }

    pub fn eof(bytes: usize) -> Self {
        Self { bytes, status: ReadStatus::Eof }
    }

    pub fn is_eof(&self) -> bool {
        self.status == ReadStatus::Eof
    }
}

/// Raw notification target handed to a handler at `start`.
///
/// Callable from any thread. The implementation (the binding's funnel)
/// decides whether a call is dispatched inline or deferred to the owner
/// thread; handlers never need to care.
pub trait TransportNotify: Send + Sync {
    /// The handler deferred work and needs [`TransportHandler::resume`]
    /// called from the owner thread with this payload.
    fn on_resume_needed(&self, data: ResumeData);

    fn on_progress(&self, code: ProgressCode, text: &str);

    /// Payload bytes became available. `progress`/`max` carry received and
    /// expected totals; `max` is zero when the total is unknown.
    fn on_data(&self, flags: DataFlags, progress: u64, max: u64);

    /// Final word from the handler, or a redirect instruction when `code`
    /// is [`ResultCode::Redirect`] (text carries the target URL).
    fn on_result(&self, code: ResultCode, text: &str);
}

/// Scheme-specific retrieval capability.
///
/// Handlers own their concurrency: an implementation may do all its work
/// synchronously inside `start` (the file adapter does) or spawn worker
/// threads and report back as bytes arrive (the http adapter does). All
/// methods must be callable from any thread.
pub trait TransportHandler: Send + Sync {
    /// Begin retrieval. `notify` is the permanent notification target for
    /// this handler instance; `config` is the caller's bind configuration,
    /// passed through untouched by the engine.
    fn start(
        &self,
        url: &str,
        notify: Arc<dyn TransportNotify>,
        config: &BindConfig,
    ) -> Result<()>;

    /// Resume previously deferred work. Payload is whatever the handler
    /// passed to [`TransportNotify::on_resume_needed`].
    fn resume(&self, _data: &ResumeData) -> Result<()> {
        Ok(())
    }

    /// Cancel the retrieval. Must be safe from any thread; the handler
    /// reports the abort through its notification target.
    fn abort(&self, reason: &str) -> Result<()>;

    /// Release all resources. No notification may be issued afterwards.
    fn terminate(&self);

    /// Non-blocking read of retrieved bytes.
    fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome>;

    /// Keep retrieved data readable even after `terminate` is requested,
    /// until `unlock` releases it.
    fn lock(&self) {}

    fn unlock(&self) {}
}

/// Produces a fresh handler per bind attempt (including redirects).
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Arc<dyn TransportHandler>;
}

impl<F> TransportFactory for F
where
    F: Fn() -> Arc<dyn TransportHandler> + Send + Sync,
{
    fn create(&self) -> Arc<dyn TransportHandler> {
        self()
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no transport registered for scheme: {0}")]
    SchemeNotSupported(String),
}

/// Registry mapping URL schemes to handler factories.
pub struct TransportRegistry {
    factories: BTreeMap<String, Arc<dyn TransportFactory>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self { factories: BTreeMap::new() }
    }

    /// Registry with the built-in `file`, `http` and `https` adapters.
    pub fn with_defaults() -> Self {
        Self::with_http_config(HttpConfig::default())
    }

    /// Like [`with_defaults`](Self::with_defaults) but with explicit HTTP
    /// tunables.
    pub fn with_http_config(config: HttpConfig) -> Self {
        let mut registry = Self::new();
        registry.register(
            "file",
            || -> Arc<dyn TransportHandler> { Arc::new(FileTransport::new()) },
        );

        let http_factory = Arc::new(HttpFactory { config });
        registry.register_arc("http", http_factory.clone());
        registry.register_arc("https", http_factory);
        registry
    }

    pub fn register(
        &mut self,
        scheme: impl Into<String>,
        factory: impl TransportFactory + 'static,
    ) {
        self.register_arc(scheme, Arc::new(factory));
    }

    pub fn register_arc(
        &mut self,
        scheme: impl Into<String>,
        factory: Arc<dyn TransportFactory>,
    ) {
        self.factories.insert(scheme.into().to_ascii_lowercase(), factory);
    }

    pub fn has_scheme(&self, scheme: &str) -> bool {
        self.factories.contains_key(&scheme.to_ascii_lowercase())
    }

    /// Create a fresh handler for the URL's scheme.
    pub fn resolve(&self, url: &str) -> std::result::Result<Arc<dyn TransportHandler>, RegistryError> {
        let scheme = scheme_of(url)
            .ok_or_else(|| RegistryError::SchemeNotSupported(url.to_string()))?;
        self.factories
            .get(&scheme)
            .map(|f| f.create())
            .ok_or(RegistryError::SchemeNotSupported(scheme))
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

struct HttpFactory {
    config: HttpConfig,
}

impl TransportFactory for HttpFactory {
    fn create(&self) -> Arc<dyn TransportHandler> {
        Arc::new(HttpTransport::new(self.config.clone()))
    }
}

/// Extracts the lowercased scheme from a URL, if it has one.
pub fn scheme_of(url: &str) -> Option<String> {
    let (scheme, _) = url.split_once(':')?;
    if scheme.is_empty()
        || !scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        || !scheme.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
    {
        return None;
    }
    Some(scheme.to_ascii_lowercase())
}
