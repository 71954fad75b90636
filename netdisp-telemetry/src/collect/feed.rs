//! Non-blocking line reader for the port telemetry pipe.
//!
//! The feed is a named pipe written by the switch agent. It is opened with
//! `O_NONBLOCK` so that a drained channel reports "no data" at once instead
//! of stalling the display loop; a partially written line is held back until
//! its newline arrives.

use super::ports::{PortTable, PortUpdate};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Default upper bound on records applied per drain.
pub const DEFAULT_MAX_LINES: usize = 256;

/// Longest line kept while waiting for its newline. A valid record is well
/// under 100 bytes; anything past this is discarded up to the next newline.
pub const MAX_LINE_BYTES: usize = 1024;

/// Errors from the underlying channel. Parse failures are not errors here.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("port feed {path} unavailable: {source}")]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Buffered line reader over a (usually non-blocking) byte source.
pub struct PortFeed<R> {
    reader: BufReader<R>,
    partial: Vec<u8>,
    /// Dropping the rest of an over-long line until its newline shows up.
    discarding: bool,
    overlong_lines: usize,
    path: PathBuf,
}

impl PortFeed<File> {
    /// Open `path` read-only and non-blocking.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FeedError> {
        let path = path.as_ref();
        let mut options = OpenOptions::new();
        options.read(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_NONBLOCK);
        }
        let file = options.open(path).map_err(|source| FeedError::SourceUnavailable {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Port feed opened");
        Ok(Self::with_path(file, path))
    }
}

impl<R: Read> PortFeed<R> {
    pub fn new(inner: R) -> Self {
        Self::with_path(inner, "<stream>")
    }

    fn with_path(inner: R, path: impl Into<PathBuf>) -> Self {
        Self {
            reader: BufReader::new(inner),
            partial: Vec::new(),
            discarding: false,
            overlong_lines: 0,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of an incomplete line waiting for its newline.
    pub fn pending_bytes(&self) -> usize {
        self.partial.len()
    }

    /// Lines dropped so far for exceeding [`MAX_LINE_BYTES`].
    pub fn overlong_lines(&self) -> usize {
        self.overlong_lines
    }

    /// Next complete line without its terminator, or `None` when no complete
    /// line is available right now (end of stream or the pipe would block).
    ///
    /// At most [`MAX_LINE_BYTES`] of an unfinished line are buffered.
    pub fn next_line(&mut self) -> Result<Option<String>, FeedError> {
        loop {
            let budget = (MAX_LINE_BYTES + 1).saturating_sub(self.partial.len()) as u64;
            let read = self
                .reader
                .by_ref()
                .take(budget)
                .read_until(b'\n', &mut self.partial);

            match read {
                Ok(_) if self.partial.last() == Some(&b'\n') => {
                    let raw = std::mem::take(&mut self.partial);
                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    let line = String::from_utf8_lossy(&raw);
                    return Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()));
                }
                Ok(_) if self.partial.len() > MAX_LINE_BYTES => {
                    if !self.discarding {
                        self.discarding = true;
                        self.overlong_lines += 1;
                        warn!(
                            max_bytes = MAX_LINE_BYTES,
                            path = %self.path.display(),
                            "Dropping over-long port feed line"
                        );
                    }
                    self.partial.clear();
                }
                // EOF with nothing, or a fragment we keep for the next call
                Ok(_) => return Ok(None),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(source) => {
                    return Err(FeedError::SourceUnavailable {
                        path: self.path.clone(),
                        source,
                    });
                }
            }
        }
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub applied: Vec<PortUpdate>,
    pub rejected: usize,
    /// True when the pass stopped at `max_lines` with data possibly left.
    pub truncated: bool,
}

/// Apply every complete line currently available to `table`.
///
/// Malformed, over-long and out-of-range records are logged, skipped and
/// counted as rejected. Stops at the
/// first "no data" result or after `max_lines` records.
pub fn drain<R: Read>(
    feed: &mut PortFeed<R>,
    table: &mut PortTable,
    max_lines: usize,
) -> Result<DrainSummary, FeedError> {
    let mut summary = DrainSummary::default();

    for _ in 0..max_lines {
        let overlong_seen = feed.overlong_lines();
        let next = feed.next_line();
        summary.rejected += feed.overlong_lines() - overlong_seen;
        let Some(line) = next? else {
            return Ok(summary);
        };
        if line.trim().is_empty() {
            continue;
        }
        match table.ingest(&line) {
            Ok(update) => summary.applied.push(update),
            Err(e) => {
                warn!(error = %e, line = %line, "Dropping port record");
                summary.rejected += 1;
            }
        }
    }

    summary.truncated = true;
    debug!(max_lines = max_lines, "Port feed drain hit line limit");
    Ok(summary)
}
