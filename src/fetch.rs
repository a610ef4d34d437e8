//! Concurrent URL fetcher on top of the transfer engine
//!
//! Every URL becomes one libcurl easy handle submitted to a single
//! [`TransferEngine`] driven by the tokio [`EventLoop`]. Bodies are streamed
//! to files (or only counted) from the write callback; a body that grows past
//! the configured cap is refused, which makes libcurl abort that transfer.

use std::cell::RefCell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

use curl::easy::Easy2;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ByteSize, Config};
use crate::engine::{
    EngineError, HandleError, Outcome, TransferEngine, TransferHandle, TransferId,
};
use crate::multiplex::MultiplexError;
use crate::multiplex::curl::{CurlMultiplexer, CurlTransfer};
use crate::reactor::EventLoop;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Transfer engine failed: {0}")]
    Engine(#[from] EngineError),

    #[error("libcurl multi handle unavailable: {0}")]
    Multiplex(#[from] MultiplexError),

    #[error("Invalid request for {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: curl::Error,
    },

    #[error("Transfer handle rejected callback: {0}")]
    Handle(#[from] HandleError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, FetchError>;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Directory receiving one file per URL; bodies are only counted when unset
    pub output_dir: Option<PathBuf>,
    pub max_body: ByteSize,
}

/// Result of fetching one URL
#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub url: String,
    pub transfer: u64,
    pub status: Option<u32>,
    pub bytes: u64,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FetchReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// One line for terminal output
    pub fn summary(&self) -> String {
        let status = self
            .status
            .filter(|code| *code > 0)
            .map(|code| code.to_string())
            .unwrap_or_else(|| "---".to_string());
        let mut line = format!(
            "{} {:>8} {:>6}ms {}",
            status,
            ByteSize(self.bytes).to_human_readable(),
            self.elapsed_ms,
            self.url
        );
        if let Some(error) = &self.error {
            line.push_str(&format!(" ({})", error));
        }
        line
    }
}

/// Streaming state of one body
struct BodySink {
    limit: u64,
    received: u64,
    file: Option<(PathBuf, BufWriter<File>)>,
    error: Option<String>,
}

impl BodySink {
    fn new(limit: u64, path: Option<PathBuf>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                let file = File::create(&path).map_err(|source| FetchError::Io {
                    path: path.clone(),
                    source,
                })?;
                Some((path, BufWriter::new(file)))
            }
            None => None,
        };
        Ok(Self {
            limit,
            received: 0,
            file,
            error: None,
        })
    }

    /// Bytes accepted; anything short of `chunk.len()` aborts the transfer
    fn accept(&mut self, chunk: &[u8]) -> usize {
        if self.received + chunk.len() as u64 > self.limit {
            self.error = Some(format!(
                "body exceeds limit of {}",
                ByteSize(self.limit).to_human_readable()
            ));
            return 0;
        }
        if let Some((path, writer)) = self.file.as_mut() {
            if let Err(err) = writer.write_all(chunk) {
                self.error = Some(format!("writing {}: {}", path.display(), err));
                return 0;
            }
        }
        self.received += chunk.len() as u64;
        chunk.len()
    }

    fn finish(&mut self) -> Option<String> {
        if let Some((path, writer)) = self.file.as_mut() {
            if let Err(err) = writer.flush() {
                self.error
                    .get_or_insert_with(|| format!("writing {}: {}", path.display(), err));
            }
        }
        self.error.take()
    }

    fn path(&self) -> Option<PathBuf> {
        self.file.as_ref().map(|(path, _)| path.clone())
    }
}

/// File name for the `index`-th URL: a sanitized last path segment
pub fn output_name(index: usize, url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let after_scheme = without_query
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_query);
    let segment = match after_scheme.split_once('/') {
        Some((_, path)) => path.rsplit('/').next().unwrap_or(""),
        None => "",
    };
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let name = match cleaned.trim_matches('.') {
        "" => "index.html",
        name => name,
    };
    format!("{:03}-{}", index, name)
}

type Reports = Rc<RefCell<Vec<(usize, FetchReport)>>>;

fn prepare(
    index: usize,
    url: &str,
    config: &Config,
    options: &FetchOptions,
    reports: &Reports,
) -> Result<TransferHandle<Easy2<CurlTransfer>>> {
    let easy = CurlTransfer::request(url, &config.transfer).map_err(|source| FetchError::Request {
        url: url.to_string(),
        source,
    })?;
    let path = options
        .output_dir
        .as_deref()
        .map(|dir: &Path| dir.join(output_name(index, url)));
    let body = Rc::new(RefCell::new(BodySink::new(options.max_body.as_u64(), path)?));

    let mut handle = TransferHandle::new(easy);

    let writer = Rc::clone(&body);
    handle.set_write_callback(move |_id: TransferId, chunk: &[u8]| {
        writer.borrow_mut().accept(chunk)
    })?;

    let reports = Rc::clone(reports);
    let url = url.to_string();
    let started = Instant::now();
    handle.set_completion_callback(move |handle, outcome| {
        let id = handle.id().map(|id| id.as_u64()).unwrap_or_default();
        let easy = handle.into_transfer();
        let mut body = body.borrow_mut();
        let body_error = body.finish();
        let error = match (outcome, body_error) {
            // our own refusal explains the abort better than libcurl's wording
            (Outcome::Failure(_), Some(reason)) => Some(reason),
            (Outcome::Failure(reason), None) => Some(reason.to_string()),
            (Outcome::Success, reason) => reason,
        };
        let report = FetchReport {
            url,
            transfer: id,
            status: easy.response_code().ok(),
            bytes: body.received,
            elapsed_ms: started.elapsed().as_millis() as u64,
            output: body.path(),
            error,
        };
        debug!(transfer = id, status = ?report.status, bytes = report.bytes, "Fetch finished");
        reports.borrow_mut().push((index, report));
    })?;

    Ok(handle)
}

/// Fetch every URL concurrently; reports come back in input order
pub async fn run(urls: &[String], config: &Config, options: &FetchOptions) -> Result<Vec<FetchReport>> {
    if let Some(dir) = &options.output_dir {
        std::fs::create_dir_all(dir).map_err(|source| FetchError::Io {
            path: dir.clone(),
            source,
        })?;
    }

    let mut engine = TransferEngine::new(CurlMultiplexer::new()?, EventLoop::new(), &config.engine);
    let reports = Reports::default();

    info!(count = urls.len(), "Starting fetch");
    for (index, url) in urls.iter().enumerate() {
        let handle = prepare(index, url, config, options, &reports)?;
        engine.submit(handle)?;
    }

    engine.run().await?;

    for err in engine.drain_errors() {
        warn!(error = %err, "Engine reported an error during fetch");
    }
    let snapshot = engine.metrics().snapshot();
    info!(
        completed = snapshot.completed,
        failed = snapshot.failed,
        "Fetch finished"
    );

    let mut collected = reports.take();
    collected.sort_by_key(|(index, _)| *index);
    Ok(collected.into_iter().map(|(_, report)| report).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_output_name() {
        assert_eq!(output_name(0, "https://example.com/a/b/file.tar.gz"), "000-file.tar.gz");
        assert_eq!(output_name(3, "https://example.com/"), "003-index.html");
        assert_eq!(output_name(4, "https://example.com"), "004-index.html");
        assert_eq!(output_name(12, "http://h/x y?q=1#frag"), "012-x_y");
        assert_eq!(output_name(1, "http://h/.."), "001-index.html");
    }

    #[test]
    fn test_body_sink_enforces_limit() {
        let mut body = BodySink::new(8, None).unwrap();
        assert_eq!(body.accept(b"12345"), 5);
        assert_eq!(body.accept(b"6789"), 0);
        assert_eq!(body.received, 5);
        assert_eq!(body.finish().as_deref(), Some("body exceeds limit of 8B"));
    }

    #[test]
    fn test_body_sink_writes_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("out.bin");
        let mut body = BodySink::new(1024, Some(path.clone())).unwrap();

        body.accept(b"hello ");
        body.accept(b"world");
        assert_eq!(body.finish(), None);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
        assert_eq!(body.path(), Some(path));
    }

    #[test]
    fn test_report_summary() {
        let report = FetchReport {
            url: "http://example.com/".to_string(),
            transfer: 1,
            status: Some(200),
            bytes: 2048,
            elapsed_ms: 15,
            output: None,
            error: None,
        };
        assert_eq!(report.summary(), "200      2KB     15ms http://example.com/");

        let failed = FetchReport {
            status: Some(0),
            error: Some("aborted".to_string()),
            ..report
        };
        assert!(failed.summary().starts_with("---"));
        assert!(failed.summary().ends_with("(aborted)"));
        assert!(!failed.is_success());
    }
}
