//! `fetch` command: drive one binding to completion from a parked thread

use std::fs::File;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use bindbox::binding::{
    BindConfig, BindOptions, Binding, QueueWaker, RequestVerb, ThreadWaker,
};
use bindbox::config::{ByteSize, Config};
use bindbox::sink::{BindSink, DataFlags, DataSource, ProgressCode, ResultCode};
use bindbox::transport::{ReadStatus, TransportRegistry};

use crate::cli::FetchArgs;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Sink that streams the payload to a writer and remembers the outcome.
struct CliSink {
    out: Mutex<Box<dyn Write + Send>>,
    bytes: AtomicU64,
    result: Mutex<Option<(ResultCode, String)>>,
}

impl CliSink {
    fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            bytes: AtomicU64::new(0),
            result: Mutex::new(None),
        }
    }

    fn result(&self) -> Option<(ResultCode, String)> {
        self.result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl BindSink for CliSink {
    fn on_start_binding(&self) {
        debug!("bind started");
    }

    fn on_progress(&self, _progress: u64, _total: u64, code: ProgressCode, text: &str) {
        debug!(?code, text, "progress");
    }

    fn on_data_available(
        &self,
        _flags: DataFlags,
        _progress: u64,
        _max: u64,
        data: &dyn DataSource,
    ) {
        let mut buf = [0u8; 16384];
        loop {
            match data.read(&mut buf) {
                Ok(outcome) => {
                    if outcome.bytes > 0 {
                        let mut out =
                            self.out.lock().unwrap_or_else(PoisonError::into_inner);
                        if let Err(e) = out.write_all(&buf[..outcome.bytes]) {
                            warn!(error = %e, "write failed");
                            return;
                        }
                        self.bytes
                            .fetch_add(outcome.bytes as u64, Ordering::Relaxed);
                    }
                    match outcome.status {
                        ReadStatus::Eof => return,
                        ReadStatus::Partial if outcome.bytes == 0 => return,
                        _ => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "read failed");
                    return;
                }
            }
        }
    }

    fn on_stop_binding(&self, code: ResultCode, text: &str) {
        *self.result.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((code, text.to_string()));
    }
}

pub fn run(args: FetchArgs, config: Config) -> Result<(), AnyError> {
    let out: Box<dyn Write + Send> = match &args.output {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout()),
    };
    let sink = Arc::new(CliSink::new(out));

    let waker = ThreadWaker::new();
    let waker_handle: Arc<dyn QueueWaker> = waker.clone();

    let transports =
        TransportRegistry::with_http_config(config.http.to_transport_config());
    let options = BindOptions::builder()
        .transports(Arc::new(transports))
        .verify_media_type(config.fetch.verify_media_type && !args.no_verify)
        .max_redirects(args.max_redirects.unwrap_or(config.fetch.max_redirects))
        .queue_capacity(config.fetch.queue_capacity)
        .waker(waker_handle)
        .build();
    let binding = Binding::new(options);

    let extra_headers = if args.headers.is_empty() {
        None
    } else {
        Some(args.headers.join("\n"))
    };
    let bind_config = BindConfig::builder()
        .verb(parse_verb(&args.verb))
        .maybe_extra_headers(extra_headers)
        .maybe_requested_type(args.accept.clone())
        .build();

    binding.start(&args.url, sink.clone(), bind_config)?;

    // Park until woken, drain, repeat. The timeout only bounds how long a
    // missed wake could stall us; correctness comes from pump.
    while !binding.is_complete() || binding.has_pending_tasks() {
        waker.wait_timeout(Duration::from_millis(50));
        binding.pump();
    }

    sink.out
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .flush()?;

    let content_type = binding.content_type();
    let snapshot = binding.metrics().snapshot();
    binding.terminate()?;

    let (code, text) = sink
        .result()
        .unwrap_or((ResultCode::Failed, "no result reported".to_string()));
    let bytes = sink.bytes.load(Ordering::Relaxed);

    if args.json {
        let summary = json!({
            "url": args.url,
            "result": format!("{code:?}"),
            "detail": text,
            "content_type": content_type,
            "bytes": bytes,
            "redirects": snapshot.redirects_followed,
        });
        println!("{summary}");
    } else {
        eprintln!(
            "{} {} ({}, {})",
            if code.is_success() { "fetched" } else { "failed" },
            args.url,
            content_type.as_deref().unwrap_or("unknown type"),
            ByteSize(bytes).display(),
        );
    }

    if code.is_success() {
        Ok(())
    } else {
        Err(format!("fetch failed: {text}").into())
    }
}

fn parse_verb(verb: &str) -> RequestVerb {
    match verb.to_ascii_uppercase().as_str() {
        "GET" => RequestVerb::Get,
        "POST" => RequestVerb::Post,
        "PUT" => RequestVerb::Put,
        "HEAD" => RequestVerb::Head,
        other => RequestVerb::Custom(other.to_string()),
    }
}
