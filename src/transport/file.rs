//! file-scheme transport
//!
//! Fully synchronous: `start` opens the target, proposes a type from the
//! extension, and reports one data notification plus the terminal result
//! before returning. Every sink call for a file bind therefore happens on
//! the owner thread with an empty task queue.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use super::{ReadOutcome, Result, TransportError, TransportHandler, TransportNotify};
use crate::binding::BindConfig;
use crate::sink::{DataFlags, ProgressCode, ResultCode};
use crate::sniff::extension_type;

pub struct FileTransport {
    file: Mutex<Option<File>>,
    locked: AtomicBool,
    terminated: AtomicBool,
    aborted: AtomicBool,
}

impl FileTransport {
    pub fn new() -> Self {
        Self {
            file: Mutex::new(None),
            locked: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
        }
    }

    fn release_file(&self) {
        if let Ok(mut guard) = self.file.lock() {
            *guard = None;
        }
    }
}

impl Default for FileTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportHandler for FileTransport {
    fn start(
        &self,
        url: &str,
        notify: Arc<dyn TransportNotify>,
        _config: &BindConfig,
    ) -> Result<()> {
        let path = match file_url_path(url) {
            Ok(path) => path,
            Err(e) => {
                warn!(url, error = %e, "file transport rejected url");
                notify.on_result(e.result_code(), &e.to_string());
                return Ok(());
            }
        };

        notify.on_progress(ProgressCode::SendingRequest, &path.display().to_string());

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                let err = match e.kind() {
                    std::io::ErrorKind::NotFound => {
                        TransportError::NotFound(path.display().to_string())
                    }
                    std::io::ErrorKind::PermissionDenied => {
                        TransportError::Denied(path.display().to_string())
                    }
                    _ => TransportError::Failed(e.to_string()),
                };
                notify.on_result(err.result_code(), &err.to_string());
                return Ok(());
            }
        };

        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        debug!(path = %path.display(), size, "file opened");

        if let Some(ty) = extension_type(url) {
            notify.on_progress(ProgressCode::SuggestedContentType, ty);
        }

        {
            let mut guard = self.file.lock().map_err(|_| {
                TransportError::Failed("file slot poisoned".to_string())
            })?;
            *guard = Some(file);
        }

        if self.aborted.load(Ordering::SeqCst) {
            notify.on_result(ResultCode::Aborted, "aborted before transfer");
            return Ok(());
        }

        // The whole payload is readable immediately: one data notification
        // carrying both position markers, then the terminal result.
        notify.on_data(DataFlags::FIRST | DataFlags::LAST, size, size);

        if self.aborted.load(Ordering::SeqCst) {
            notify.on_result(ResultCode::Aborted, "aborted during transfer");
        } else {
            notify.on_result(ResultCode::Ok, "");
        }
        Ok(())
    }

    fn abort(&self, reason: &str) -> Result<()> {
        debug!(reason, "file transport abort");
        self.aborted.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        if !self.locked.load(Ordering::SeqCst) {
            self.release_file();
        }
    }

    fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        let mut guard = self
            .file
            .lock()
            .map_err(|_| TransportError::Failed("file slot poisoned".to_string()))?;
        let Some(file) = guard.as_mut() else {
            return Err(TransportError::Terminated);
        };

        let n = file
            .read(buf)
            .map_err(|e| TransportError::Failed(e.to_string()))?;
        if n == 0 {
            Ok(ReadOutcome::eof(0))
        } else if n == buf.len() {
            Ok(ReadOutcome::filled(n))
        } else {
            Ok(ReadOutcome::partial(n))
        }
    }

    fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
        if self.terminated.load(Ordering::SeqCst) {
            self.release_file();
        }
    }
}

/// Maps a `file:` URL to a filesystem path.
///
/// Accepts `file:///abs/path`, `file://localhost/abs/path` and the sloppy
/// `file:/abs/path` form; any other authority is rejected. Percent-escapes
/// in the path are decoded.
fn file_url_path(url: &str) -> Result<PathBuf> {
    let rest = url
        .strip_prefix("file:")
        .ok_or_else(|| TransportError::Failed(format!("not a file url: {url}")))?;

    let path = if let Some(after) = rest.strip_prefix("//") {
        let (host, path) = after
            .find('/')
            .map(|i| after.split_at(i))
            .ok_or_else(|| TransportError::Failed(format!("no path in file url: {url}")))?;
        if !host.is_empty() && !host.eq_ignore_ascii_case("localhost") {
            return Err(TransportError::Failed(format!(
                "unsupported file url host: {host}"
            )));
        }
        path
    } else {
        rest
    };

    if !path.starts_with('/') {
        return Err(TransportError::Failed(format!(
            "file url path must be absolute: {url}"
        )));
    }

    Ok(PathBuf::from(percent_decode(path)))
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &s[i + 1..i + 3];
            if let Ok(b) = u8::from_str_radix(hex, 16) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
