//! Replay manifest: durable per-connection replay pointers
//!
//! The manifest is a small file with one line per connection. It is never
//! edited in place. Every change builds the complete new content in a
//! temporary file next to the live one, syncs it, and renames it over the
//! live file, so a reader (or a restart after a crash) sees either the old
//! manifest or the new one and never a mix of both.
//!
//! All changes are serialized by a single lock covering the whole manifest.

use crate::error::{JournalError, Result};
use crate::record::{parse_line, render_line, ManifestEntry, MANIFEST_LOG_NAME};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// File name of the manifest inside the log location
pub const MANIFEST_FILE_NAME: &str = "manifest.log";

/// In-memory view of the manifest backed by an atomically rewritten file
#[derive(Debug)]
pub struct Manifest {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, ManifestEntry>>,
}

impl Manifest {
    /// Load the manifest at `path`, or start empty if it does not exist yet
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries = BTreeMap::new();

        if path.exists() {
            let content = fs::read_to_string(&path)?;
            for (index, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let entry: ManifestEntry =
                    parse_line(line).map_err(|reason| JournalError::MalformedLine {
                        path: path.clone(),
                        line: index as u64,
                        reason,
                    })?;
                // Later lines win if a connection appears twice
                entries.insert(entry.connection_name.clone(), entry);
            }
            debug!(path = %path.display(), connections = entries.len(), "Loaded replay manifest");
        }

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Location of the live manifest file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of one connection's entry
    pub fn get(&self, connection: &str) -> Option<ManifestEntry> {
        self.entries.lock().get(connection).cloned()
    }

    /// Replay pointer for a connection, if it has an entry
    pub fn pointer(&self, connection: &str) -> Option<u64> {
        self.entries
            .lock()
            .get(connection)
            .map(|entry| entry.next_message_to_send)
    }

    /// Snapshot of all entries, ordered by connection name
    pub fn entries(&self) -> Vec<ManifestEntry> {
        self.entries.lock().values().cloned().collect()
    }

    /// Apply a change to a copy of the manifest and make it durable.
    ///
    /// `mutate` returns whether it changed anything; unchanged manifests are
    /// not rewritten. The in-memory state only moves once the new file is in
    /// place. Returns whether a rewrite happened.
    pub fn update<F>(&self, mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut BTreeMap<String, ManifestEntry>) -> Result<bool>,
    {
        let mut live = self.entries.lock();
        let mut next = live.clone();

        if !mutate(&mut next)? {
            return Ok(false);
        }

        self.persist(&next)?;
        *live = next;
        Ok(true)
    }

    fn persist(&self, entries: &BTreeMap<String, ManifestEntry>) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        // Dropping the temp file on any early return removes it
        let mut temp = NamedTempFile::new_in(dir)?;
        {
            let file = temp.as_file_mut();
            for entry in entries.values() {
                let line = render_line(MANIFEST_LOG_NAME, entry)?;
                file.write_all(line.as_bytes())?;
            }
            file.sync_all()?;
        }

        temp.persist(&self.path)
            .map_err(|e| JournalError::Io(e.error))?;
        sync_dir(dir);

        Ok(())
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
        warn!(dir = %dir.display(), error = %e, "Failed to sync manifest directory");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(name: &str, pointer: u64) -> ManifestEntry {
        ManifestEntry {
            connection_name: name.to_string(),
            log_location: PathBuf::from(format!("/logs/{}.delivery.log", name)),
            next_message_to_send: pointer,
        }
    }

    #[test]
    fn test_missing_manifest_loads_empty() {
        let dir = tempdir().unwrap();
        let manifest = Manifest::load(dir.path().join(MANIFEST_FILE_NAME)).unwrap();
        assert!(manifest.entries().is_empty());
        assert_eq!(manifest.pointer("q1"), None);
    }

    #[test]
    fn test_update_persists_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE_NAME);
        let manifest = Manifest::load(&path).unwrap();

        let rewritten = manifest
            .update(|entries| {
                entries.insert("q1".to_string(), entry("q1", 0));
                entries.insert("q2".to_string(), entry("q2", 4));
                Ok(true)
            })
            .unwrap();
        assert!(rewritten);

        let reloaded = Manifest::load(&path).unwrap();
        assert_eq!(reloaded.pointer("q1"), Some(0));
        assert_eq!(reloaded.pointer("q2"), Some(4));

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.lines().all(|l| l.contains(" INFO manifest {")));
    }

    #[test]
    fn test_unchanged_update_skips_rewrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE_NAME);
        let manifest = Manifest::load(&path).unwrap();

        assert!(!manifest.update(|_| Ok(false)).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_failed_mutation_leaves_state_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE_NAME);
        let manifest = Manifest::load(&path).unwrap();
        manifest
            .update(|entries| {
                entries.insert("q1".to_string(), entry("q1", 2));
                Ok(true)
            })
            .unwrap();

        let result = manifest.update(|entries| {
            entries.get_mut("q1").unwrap().next_message_to_send = 9;
            Err(JournalError::UnknownConnection("q1".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(manifest.pointer("q1"), Some(2));
        assert_eq!(Manifest::load(&path).unwrap().pointer("q1"), Some(2));
    }

    #[test]
    fn test_failed_persist_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        // The manifest path is a directory, so the final rename must fail
        let path = dir.path().join(MANIFEST_FILE_NAME);
        fs::create_dir(&path).unwrap();
        fs::write(path.join("occupied"), b"x").unwrap();

        let manifest = Manifest {
            path: path.clone(),
            entries: Mutex::new(BTreeMap::new()),
        };
        let result = manifest.update(|entries| {
            entries.insert("q1".to_string(), entry("q1", 1));
            Ok(true)
        });

        assert!(result.is_err());
        assert_eq!(manifest.pointer("q1"), None);

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|name| name != MANIFEST_FILE_NAME)
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {:?}", leftovers);
    }

    #[test]
    fn test_malformed_manifest_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE_NAME);
        fs::write(&path, "not a manifest line\n").unwrap();

        let result = Manifest::load(&path);
        assert!(matches!(result, Err(JournalError::MalformedLine { line: 0, .. })));
    }
}
