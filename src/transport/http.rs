//! http/https transport
//!
//! Drives an async `reqwest` client on a dedicated worker thread with a
//! current-thread runtime; retrieved chunks land in a shared buffer that
//! the owner thread drains through `read`. Automatic redirect following is
//! disabled — a 3xx response is reported as a redirect result and the
//! binding decides what to do with it.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, warn};

use super::{ReadOutcome, Result, TransportError, TransportHandler, TransportNotify};
use crate::binding::{BindConfig, RequestVerb};
use crate::sink::{DataFlags, ProgressCode, ResultCode};

/// HTTP client tunables.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub user_agent: String,
    /// Hard cap on the response body; `None` means unlimited.
    pub max_body_bytes: Option<u64>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            user_agent: concat!("bindbox/", env!("CARGO_PKG_VERSION")).to_string(),
            max_body_bytes: None,
        }
    }
}

#[derive(Default)]
struct HttpShared {
    buf: Mutex<BytesMut>,
    eof: AtomicBool,
    aborted: AtomicBool,
    locked: AtomicBool,
    terminated: AtomicBool,
}

impl HttpShared {
    fn release_buf(&self) {
        if let Ok(mut buf) = self.buf.lock() {
            *buf = BytesMut::new();
        }
    }
}

pub struct HttpTransport {
    config: HttpConfig,
    shared: Arc<HttpShared>,
}

impl HttpTransport {
    pub fn new(config: HttpConfig) -> Self {
        Self {
            config,
            shared: Arc::new(HttpShared::default()),
        }
    }
}

impl TransportHandler for HttpTransport {
    fn start(
        &self,
        url: &str,
        notify: Arc<dyn TransportNotify>,
        config: &BindConfig,
    ) -> Result<()> {
        let url = url.to_string();
        let bind_config = config.clone();
        let http_config = self.config.clone();
        let shared = Arc::clone(&self.shared);

        thread::Builder::new()
            .name("bindbox-http".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        notify.on_result(
                            ResultCode::Failed,
                            &format!("runtime setup failed: {e}"),
                        );
                        return;
                    }
                };

                runtime.block_on(run_request(
                    &url,
                    &bind_config,
                    &http_config,
                    &shared,
                    notify.as_ref(),
                ));
            })
            .map_err(|e| TransportError::Failed(format!("worker spawn failed: {e}")))?;

        Ok(())
    }

    fn abort(&self, reason: &str) -> Result<()> {
        debug!(reason, "http transport abort");
        self.shared.aborted.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn terminate(&self) {
        self.shared.terminated.store(true, Ordering::SeqCst);
        self.shared.aborted.store(true, Ordering::SeqCst);
        if !self.shared.locked.load(Ordering::SeqCst) {
            self.shared.release_buf();
        }
    }

    fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        let mut pending = self
            .shared
            .buf
            .lock()
            .map_err(|_| TransportError::Failed("buffer poisoned".to_string()))?;

        let n = pending.len().min(buf.len());
        if n > 0 {
            let chunk = pending.split_to(n);
            buf[..n].copy_from_slice(&chunk);
        }

        if n == buf.len() && n > 0 {
            Ok(ReadOutcome::filled(n))
        } else if pending.is_empty() && self.shared.eof.load(Ordering::SeqCst) {
            Ok(ReadOutcome::eof(n))
        } else {
            Ok(ReadOutcome::partial(n))
        }
    }

    fn lock(&self) {
        self.shared.locked.store(true, Ordering::SeqCst);
    }

    fn unlock(&self) {
        self.shared.locked.store(false, Ordering::SeqCst);
        if self.shared.terminated.load(Ordering::SeqCst) {
            self.shared.release_buf();
        }
    }
}

async fn run_request(
    url: &str,
    bind_config: &BindConfig,
    http_config: &HttpConfig,
    shared: &HttpShared,
    notify: &dyn TransportNotify,
) {
    let client = match reqwest::Client::builder()
        .connect_timeout(http_config.connect_timeout)
        .timeout(http_config.request_timeout)
        .user_agent(&http_config.user_agent)
        .redirect(reqwest::redirect::Policy::none())
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            notify.on_result(ResultCode::Failed, &format!("client setup failed: {e}"));
            return;
        }
    };

    notify.on_progress(ProgressCode::Connecting, host_of(url).unwrap_or(url));

    let method = match request_method(&bind_config.verb) {
        Ok(method) => method,
        Err(e) => {
            notify.on_result(e.result_code(), &e.to_string());
            return;
        }
    };

    let mut request = client.request(method, url);
    if let Some(accept) = &bind_config.requested_type {
        request = request.header(reqwest::header::ACCEPT, accept);
    }
    if let Some(extra) = &bind_config.extra_headers {
        for line in extra.lines() {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            request = request.header(name.trim(), value.trim());
        }
    }

    notify.on_progress(ProgressCode::SendingRequest, url);

    let mut response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            let (code, text) = if e.is_timeout() {
                (ResultCode::Failed, "connection timed out".to_string())
            } else if e.is_connect() {
                (ResultCode::Failed, format!("connection failed: {e}"))
            } else {
                (ResultCode::Failed, e.to_string())
            };
            warn!(url, error = %text, "http request failed");
            notify.on_result(code, &text);
            return;
        }
    };

    let status = response.status();
    if status.is_redirection() {
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok());
        match location {
            Some(target) => {
                debug!(url, target, status = status.as_u16(), "redirect reported");
                notify.on_result(ResultCode::Redirect, &resolve_relative(url, target));
            }
            None => notify.on_result(
                ResultCode::Failed,
                &format!("redirect without location (HTTP {})", status.as_u16()),
            ),
        }
        return;
    }

    if !status.is_success() {
        let code = match status.as_u16() {
            404 | 410 => ResultCode::NotFound,
            401 | 403 => ResultCode::Denied,
            _ => ResultCode::Failed,
        };
        notify.on_result(
            code,
            &format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("unknown")
            ),
        );
        return;
    }

    if let Some(ct) = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        notify.on_progress(ProgressCode::SuggestedContentType, ct);
    }

    let max = response.content_length().unwrap_or(0);
    notify.on_progress(ProgressCode::BeginTransfer, "");

    let mut received: u64 = 0;
    let mut first = true;
    loop {
        if shared.aborted.load(Ordering::SeqCst) {
            notify.on_result(ResultCode::Aborted, "transfer aborted");
            return;
        }

        match response.chunk().await {
            Ok(Some(chunk)) => {
                received += chunk.len() as u64;
                if let Some(cap) = http_config.max_body_bytes {
                    if received > cap {
                        notify.on_result(
                            ResultCode::Failed,
                            &format!("response body exceeds {cap} bytes"),
                        );
                        return;
                    }
                }

                {
                    let Ok(mut buf) = shared.buf.lock() else {
                        notify.on_result(ResultCode::Failed, "buffer poisoned");
                        return;
                    };
                    buf.extend_from_slice(&chunk);
                }

                let flags = if first {
                    first = false;
                    DataFlags::FIRST
                } else {
                    DataFlags::INTERMEDIATE
                };
                notify.on_data(flags, received, max);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(url, error = %e, "body read failed");
                notify.on_result(ResultCode::Failed, &format!("body read failed: {e}"));
                return;
            }
        }
    }

    shared.eof.store(true, Ordering::SeqCst);
    debug!(url, received, "transfer complete");
    notify.on_progress(ProgressCode::EndTransfer, "");

    let mut flags = DataFlags::LAST;
    if first {
        flags |= DataFlags::FIRST;
    }
    notify.on_data(flags, received, received);
    notify.on_result(ResultCode::Ok, "");
}

fn request_method(verb: &RequestVerb) -> Result<reqwest::Method> {
    let method = match verb {
        RequestVerb::Get => reqwest::Method::GET,
        RequestVerb::Post => reqwest::Method::POST,
        RequestVerb::Put => reqwest::Method::PUT,
        RequestVerb::Head => reqwest::Method::HEAD,
        RequestVerb::Custom(name) => reqwest::Method::from_bytes(name.as_bytes())
            .map_err(|_| TransportError::Failed(format!("invalid verb: {name}")))?,
    };
    Ok(method)
}

fn host_of(url: &str) -> Option<&str> {
    let after = url.split_once("://")?.1;
    let end = after.find(['/', '?', '#']).unwrap_or(after.len());
    Some(&after[..end])
}

/// Resolves a `Location` header against the request URL. Absolute targets
/// pass through; scheme-relative and path-absolute forms are joined with
/// the original scheme/authority.
fn resolve_relative(base: &str, target: &str) -> String {
    if super::scheme_of(target).is_some() {
        return target.to_string();
    }
    let Some((scheme, rest)) = base.split_once("://") else {
        return target.to_string();
    };
    if let Some(stripped) = target.strip_prefix("//") {
        return format!("{scheme}://{stripped}");
    }
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    if target.starts_with('/') {
        return format!("{scheme}://{authority}{target}");
    }
    // Relative path: replace everything after the last slash of the base
    // path.
    let path_start = base.len() - rest.len() + authority.len();
    let base_path_end = base[path_start..]
        .rfind('/')
        .map(|i| path_start + i + 1)
        .unwrap_or(base.len());
    format!("{}{}", &base[..base_path_end.max(path_start)], ensure_slashed(target, base_path_end > path_start))
}

fn ensure_slashed(target: &str, base_has_path: bool) -> String {
    if base_has_path {
        target.to_string()
    } else {
        format!("/{target}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_config_defaults() {
        let config = HttpConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert!(config.user_agent.starts_with("bindbox/"));
        assert!(config.max_body_bytes.is_none());
    }

    #[test]
    fn test_host_extraction() {
        assert_eq!(host_of("http://example.com/a/b"), Some("example.com"));
        assert_eq!(host_of("https://example.com:8443?q"), Some("example.com:8443"));
        assert_eq!(host_of("file:///tmp/x"), Some(""));
        assert_eq!(host_of("not-a-url"), None);
    }

    #[test]
    fn test_resolve_relative_locations() {
        assert_eq!(
            resolve_relative("http://a.com/x/y", "https://b.com/z"),
            "https://b.com/z"
        );
        assert_eq!(
            resolve_relative("http://a.com/x/y", "/moved"),
            "http://a.com/moved"
        );
        assert_eq!(
            resolve_relative("https://a.com/x/y", "//b.com/z"),
            "https://b.com/z"
        );
        assert_eq!(
            resolve_relative("http://a.com/x/y", "nearby"),
            "http://a.com/x/nearby"
        );
        assert_eq!(
            resolve_relative("http://a.com", "nearby"),
            "http://a.com/nearby"
        );
    }

    #[test]
    fn test_request_method_mapping() {
        assert_eq!(request_method(&RequestVerb::Get).unwrap(), reqwest::Method::GET);
        assert_eq!(
            request_method(&RequestVerb::Custom("PURGE".to_string())).unwrap().as_str(),
            "PURGE"
        );
        assert!(request_method(&RequestVerb::Custom("bad verb".to_string())).is_err());
    }
}
