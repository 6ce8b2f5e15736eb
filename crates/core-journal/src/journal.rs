//! Delivery log: per-connection append-only logs plus the replay manifest
//!
//! Every connection gets its own log file. Messages that failed to send are
//! appended to it in order and never modified afterwards. The manifest keeps,
//! per connection, the offset of the next entry to replay. Once every entry
//! has been replayed the log is reset: the pointer goes back to zero and the
//! file is truncated.
//!
//! # Invariant
//!
//! For every connection, at every observable moment:
//!
//! ```text
//! 0 <= pointer(connection) <= entry_count(connection)
//! ```
//!
//! # Locking
//!
//! - Appends to a connection take that connection's writer lock only, so
//!   different connections never block each other.
//! - Pointer updates take the manifest lock only.
//! - `reset` and `settle` take the connection's writer lock and then the
//!   manifest lock. Nothing takes them in the opposite order.

use crate::error::{JournalError, Result};
use crate::manifest::{Manifest, MANIFEST_FILE_NAME};
use crate::record::{log_file_name, parse_line, render_line, DeliveryLogEntry, ManifestEntry};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// One connection's append-only log
#[derive(Debug)]
struct ConnectionLog {
    path: PathBuf,
    entries: AtomicU64,
    /// Append handle; holding the lock makes the caller the single writer
    writer: Mutex<File>,
}

/// Outcome of settling a drained backlog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    /// Every entry was replayed; pointer is zero and the log is empty
    Reset,
    /// Entries were appended while draining; the pointer moved to the cursor
    Advanced { remaining: u64 },
}

/// Backlog snapshot for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacklogStatus {
    pub connection_name: String,
    pub log_location: PathBuf,
    pub entries: u64,
    pub pointer: u64,
}

impl BacklogStatus {
    /// Entries at or after the replay pointer
    pub fn backlog(&self) -> u64 {
        self.entries.saturating_sub(self.pointer)
    }
}

/// Durable record of undelivered messages for a set of connections
#[derive(Debug)]
pub struct DeliveryLog {
    location: PathBuf,
    manifest: Manifest,
    logs: DashMap<String, Arc<ConnectionLog>>,
    /// Serializes opening new connection logs
    opening: Mutex<()>,
}

impl DeliveryLog {
    /// Open (or create) the delivery log at `location`.
    ///
    /// Ensures the manifest and one log file per connection exist. Every
    /// connection already present in the manifest is opened as well as the
    /// ones named here. Connections without a manifest entry are seeded with
    /// a pointer of zero, and pointers left beyond their log's end by a crash
    /// are clamped back to it.
    pub fn initialize<I, S>(location: impl Into<PathBuf>, connection_names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let location = location.into();
        fs::create_dir_all(&location)?;

        let manifest = Manifest::load(location.join(MANIFEST_FILE_NAME))?;

        let mut names: BTreeSet<String> = manifest
            .entries()
            .into_iter()
            .map(|entry| entry.connection_name)
            .collect();
        names.extend(connection_names.into_iter().map(|n| n.as_ref().to_string()));

        let log = Self {
            location,
            manifest,
            logs: DashMap::new(),
            opening: Mutex::new(()),
        };

        for name in &names {
            log.open_connection(name)?;
        }
        log.reconcile_manifest()?;

        info!(
            location = %log.location.display(),
            connections = names.len(),
            "Delivery log initialized"
        );
        Ok(log)
    }

    /// Backlog snapshot of the log at `location` without opening it.
    ///
    /// Reads the manifest and counts complete lines in each log. Nothing is
    /// created, repaired or rewritten, so it is safe to call next to a live
    /// process. `connection_names` adds connections the manifest does not
    /// know yet; they report an empty backlog unless their file exists.
    pub fn inspect<I, S>(
        location: impl AsRef<Path>,
        connection_names: I,
    ) -> Result<Vec<BacklogStatus>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let location = location.as_ref();
        let manifest = Manifest::load(location.join(MANIFEST_FILE_NAME))?;

        let mut known: BTreeMap<String, (PathBuf, u64)> = manifest
            .entries()
            .into_iter()
            .map(|entry| {
                (
                    entry.connection_name,
                    (entry.log_location, entry.next_message_to_send),
                )
            })
            .collect();
        for name in connection_names {
            let name = name.as_ref();
            known
                .entry(name.to_string())
                .or_insert_with(|| (location.join(log_file_name(name)), 0));
        }

        known
            .into_iter()
            .map(|(connection_name, (log_location, pointer))| {
                let entries = if log_location.exists() {
                    scan_log(&log_location)?.lines
                } else {
                    0
                };
                Ok(BacklogStatus {
                    connection_name,
                    log_location,
                    entries,
                    pointer,
                })
            })
            .collect()
    }

    /// Directory holding the manifest and all connection logs
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Path of the live manifest file
    pub fn manifest_path(&self) -> &Path {
        self.manifest.path()
    }

    /// Names of every connection known to the log
    pub fn connections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.logs.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Whether a connection has been registered
    pub fn contains(&self, connection: &str) -> bool {
        self.logs.contains_key(connection)
    }

    /// Register a connection added after startup
    pub fn register(&self, connection: &str) -> Result<()> {
        if self.logs.contains_key(connection) {
            return Ok(());
        }
        let log = self.open_connection(connection)?;
        self.manifest.update(|entries| {
            if entries.contains_key(connection) {
                return Ok(false);
            }
            entries.insert(
                connection.to_string(),
                fresh_entry(connection, &log.path, 0),
            );
            Ok(true)
        })?;
        debug!(connection, "Registered connection with delivery log");
        Ok(())
    }

    /// Append one undelivered message. Returns the new entry count.
    pub fn append(
        &self,
        connection: &str,
        message: &Map<String, Value>,
        send_config: &Map<String, Value>,
    ) -> Result<u64> {
        let log = self.connection_or_register(connection)?;
        let entry = DeliveryLogEntry::new(connection, message.clone(), send_config.clone());
        let line = render_line(connection, &entry)?;

        let mut file = log.writer.lock();
        let length_before = file.metadata()?.len();

        if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.sync_data()) {
            // Drop a partially written line so later appends start on a clean boundary
            if let Err(truncate_err) = file.set_len(length_before) {
                error!(connection, error = %truncate_err, "Failed to roll back partial append");
            }
            return Err(e.into());
        }

        let count = log.entries.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(connection, entries = count, "Appended undelivered message");
        Ok(count)
    }

    /// Total entries currently in a connection's log (zero if unknown)
    pub fn entry_count(&self, connection: &str) -> u64 {
        self.logs
            .get(connection)
            .map(|log| log.entries.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Offset of the next entry to replay (zero if unknown)
    pub fn pointer(&self, connection: &str) -> u64 {
        self.manifest.pointer(connection).unwrap_or(0)
    }

    /// Entries at or after the replay pointer
    pub fn backlog(&self, connection: &str) -> u64 {
        self.entry_count(connection)
            .saturating_sub(self.pointer(connection))
    }

    /// Backlog snapshot of every connection, ordered by name
    pub fn status(&self) -> Vec<BacklogStatus> {
        self.connections()
            .into_iter()
            .filter_map(|name| {
                let log = self.logs.get(&name)?;
                Some(BacklogStatus {
                    log_location: log.path.clone(),
                    entries: log.entries.load(Ordering::SeqCst),
                    pointer: self.pointer(&name),
                    connection_name: name,
                })
            })
            .collect()
    }

    /// Lazily read a connection's entries starting at `offset`.
    ///
    /// The stream ends at the entry count observed when it was created, so it
    /// is finite even while new failures are being appended. Call again to
    /// start over.
    pub fn stream_from(&self, connection: &str, offset: u64) -> Result<EntryStream> {
        let log = self.connection(connection)?;
        let end = log.entries.load(Ordering::SeqCst);
        let file = File::open(&log.path)?;

        Ok(EntryStream {
            path: log.path.clone(),
            reader: BufReader::new(file),
            buffer: Vec::new(),
            line: 0,
            start: offset,
            end,
        })
    }

    /// Durably move a connection's replay pointer.
    ///
    /// The new manifest is written to a temporary file and renamed over the
    /// live one. On failure the temporary file is removed, the pointer keeps
    /// its previous value, and the error is logged and returned.
    pub fn update_pointer(&self, connection: &str, offset: u64) -> Result<()> {
        let log = self.connection(connection)?;
        let entries = log.entries.load(Ordering::SeqCst);

        if offset > entries {
            return Err(JournalError::PointerOutOfRange {
                connection: connection.to_string(),
                offset,
                entries,
            });
        }

        let result = self.manifest.update(|manifest| {
            let entry = manifest
                .entry(connection.to_string())
                .or_insert_with(|| fresh_entry(connection, &log.path, 0));
            if entry.next_message_to_send == offset {
                return Ok(false);
            }
            entry.next_message_to_send = offset;
            Ok(true)
        });

        match result {
            Ok(_) => {
                debug!(connection, offset, "Replay pointer updated");
                Ok(())
            }
            Err(e) => {
                error!(connection, offset, error = %e, "Failed to update replay pointer");
                Err(e)
            }
        }
    }

    /// Discard a fully replayed log: pointer to zero, then truncate
    pub fn reset(&self, connection: &str) -> Result<()> {
        let log = self.connection(connection)?;
        let file = log.writer.lock();
        self.reset_locked(connection, &log, &file)
    }

    /// Finish a drain that replayed everything up to `cursor`.
    ///
    /// Resets the log if nothing was appended meanwhile; otherwise keeps the
    /// new entries and only advances the pointer.
    pub fn settle(&self, connection: &str, cursor: u64) -> Result<Settled> {
        let log = self.connection(connection)?;
        let file = log.writer.lock();
        let entries = log.entries.load(Ordering::SeqCst);

        if cursor == entries {
            self.reset_locked(connection, &log, &file)?;
            Ok(Settled::Reset)
        } else {
            self.update_pointer(connection, cursor)?;
            Ok(Settled::Advanced {
                remaining: entries.saturating_sub(cursor),
            })
        }
    }

    fn reset_locked(&self, connection: &str, log: &ConnectionLog, file: &File) -> Result<()> {
        // Pointer first: a crash before the truncate replays entries again
        // instead of leaving the pointer past the end of the log
        self.update_pointer(connection, 0)?;
        file.set_len(0)?;
        log.entries.store(0, Ordering::SeqCst);
        info!(connection, "Delivery log drained and reset");
        Ok(())
    }

    fn connection(&self, connection: &str) -> Result<Arc<ConnectionLog>> {
        self.logs
            .get(connection)
            .map(|log| Arc::clone(log.value()))
            .ok_or_else(|| JournalError::UnknownConnection(connection.to_string()))
    }

    fn connection_or_register(&self, connection: &str) -> Result<Arc<ConnectionLog>> {
        if let Some(log) = self.logs.get(connection) {
            return Ok(Arc::clone(log.value()));
        }
        self.register(connection)?;
        self.connection(connection)
    }

    fn open_connection(&self, connection: &str) -> Result<Arc<ConnectionLog>> {
        if let Some(log) = self.logs.get(connection) {
            return Ok(Arc::clone(log.value()));
        }

        let _opening = self.opening.lock();
        if let Some(log) = self.logs.get(connection) {
            return Ok(Arc::clone(log.value()));
        }

        let path = self.location.join(log_file_name(connection));

        // Case-insensitive filesystems would fold these onto one file
        let file_name = log_file_name(connection).to_ascii_lowercase();
        let clash = self.logs.iter().find_map(|e| {
            let other = e.value().path.file_name()?.to_string_lossy().to_ascii_lowercase();
            (other == file_name).then(|| e.key().clone())
        });
        if let Some(existing) = clash {
            error!(
                connection,
                existing = %existing,
                path = %path.display(),
                "Delivery log file collision"
            );
            return Err(JournalError::LogPathCollision {
                connection: connection.to_string(),
                existing,
                path,
            });
        }

        let entries = recover_log(connection, &path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let log = Arc::new(ConnectionLog {
            path,
            entries: AtomicU64::new(entries),
            writer: Mutex::new(file),
        });

        Ok(Arc::clone(
            self.logs
                .entry(connection.to_string())
                .or_insert(log)
                .value(),
        ))
    }

    fn reconcile_manifest(&self) -> Result<()> {
        let logs: Vec<(String, PathBuf, u64)> = self
            .logs
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    e.value().path.clone(),
                    e.value().entries.load(Ordering::SeqCst),
                )
            })
            .collect();

        self.manifest.update(|manifest| {
            let mut changed = false;
            for (name, path, entries) in &logs {
                match manifest.get_mut(name) {
                    None => {
                        manifest.insert(name.clone(), fresh_entry(name, path, 0));
                        changed = true;
                    }
                    Some(entry) => {
                        if entry.next_message_to_send > *entries {
                            warn!(
                                connection = %name,
                                pointer = entry.next_message_to_send,
                                entries,
                                "Replay pointer beyond end of log, clamping"
                            );
                            entry.next_message_to_send = *entries;
                            changed = true;
                        }
                        if entry.log_location != *path {
                            entry.log_location = path.clone();
                            changed = true;
                        }
                    }
                }
            }
            Ok(changed)
        })?;

        Ok(())
    }
}

fn fresh_entry(connection: &str, path: &Path, pointer: u64) -> ManifestEntry {
    ManifestEntry {
        connection_name: connection.to_string(),
        log_location: path.to_path_buf(),
        next_message_to_send: pointer,
    }
}

/// Shape of a log file on disk
struct LogScan {
    /// Complete, newline-terminated lines
    lines: u64,
    /// Bytes covered by those lines
    complete_bytes: u64,
    /// Whether an unterminated line follows them
    torn: bool,
}

fn scan_log(path: &Path) -> Result<LogScan> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buffer = Vec::new();
    let mut scan = LogScan {
        lines: 0,
        complete_bytes: 0,
        torn: false,
    };

    loop {
        buffer.clear();
        let read = reader.read_until(b'\n', &mut buffer)?;
        if read == 0 {
            break;
        }
        if buffer.last() == Some(&b'\n') {
            scan.lines += 1;
            scan.complete_bytes += read as u64;
        } else {
            scan.torn = true;
            break;
        }
    }
    Ok(scan)
}

/// Count complete lines, dropping a torn trailing line left by an interrupted append
fn recover_log(connection: &str, path: &Path) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }

    let scan = scan_log(path)?;
    if scan.torn {
        warn!(
            connection,
            path = %path.display(),
            kept_entries = scan.lines,
            "Discarding torn trailing line from interrupted append"
        );
        OpenOptions::new()
            .write(true)
            .open(path)?
            .set_len(scan.complete_bytes)?;
    }

    Ok(scan.lines)
}

/// Lazy, finite iterator over a connection's log entries
#[derive(Debug)]
pub struct EntryStream {
    path: PathBuf,
    reader: BufReader<File>,
    buffer: Vec<u8>,
    line: u64,
    start: u64,
    end: u64,
}

impl EntryStream {
    /// Offset of the entry the next call to `next` will yield
    pub fn position(&self) -> u64 {
        self.line.max(self.start)
    }

    /// Offset one past the last entry this stream will yield
    pub fn end(&self) -> u64 {
        self.end
    }
}

impl Iterator for EntryStream {
    type Item = Result<DeliveryLogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.line < self.end {
            self.buffer.clear();
            match self.reader.read_until(b'\n', &mut self.buffer) {
                Ok(0) => {
                    // Log was truncated underneath us
                    self.line = self.end;
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    self.line = self.end;
                    return Some(Err(e.into()));
                }
            }

            let current = self.line;
            self.line += 1;
            if current < self.start {
                continue;
            }

            let text = String::from_utf8_lossy(&self.buffer);
            return Some(
                parse_line(&text).map_err(|reason| JournalError::MalformedLine {
                    path: self.path.clone(),
                    line: current,
                    reason,
                }),
            );
        }
        None
    }
}
