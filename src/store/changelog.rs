//! Keyed changelog backing the state store and metadata table.
//!
//! Each entry is one JSON line `{"key":..,"value":..}` and supersedes every
//! earlier entry for its key, so only the latest entry per key is live.
//! A file changelog drops a torn final line on open, and rewrites itself to
//! the live entries once enough superseded ones pile up.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{ProcessingError, Result};
use crate::utils::constants::DEFAULT_COMPACTION_THRESHOLD;

/// Raw storage for changelog entries.
///
/// Implementations must be safe to call from many partition workers at once.
pub trait ChangelogBackend: Send + Sync {
    /// Record `entry` as the latest entry for `key`. It need not be durable
    /// until `sync`.
    fn append(&self, key: u32, entry: &[u8]) -> Result<()>;

    /// Make every appended entry durable.
    fn sync(&self) -> Result<()>;

    /// The live entry of every key, in key order.
    fn entries(&self) -> Result<Vec<Vec<u8>>>;
}

#[derive(Deserialize)]
struct EntryKey {
    key: u32,
}

struct FileLog {
    writer: BufWriter<File>,
    live: BTreeMap<u32, Vec<u8>>,
    lines: usize,
}

impl FileLog {
    fn superseded(&self) -> usize {
        self.lines.saturating_sub(self.live.len())
    }
}

/// File-backed changelog, one entry per line.
pub struct FileChangelog {
    path: PathBuf,
    compaction_threshold: usize,
    log: Mutex<FileLog>,
}

impl FileChangelog {
    /// Open `path`, creating it if needed.
    ///
    /// Lines from the first undecodable one onwards are a torn tail and are
    /// cut off before anything new is appended.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| unavailable(path, "create directory", e))?;
        }

        let (live, lines, torn) = load(path)?;
        let needs_rewrite = torn || lines > live.len();
        let writer = BufWriter::new(open_append(path)?);

        let changelog = Self {
            path: path.to_path_buf(),
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            log: Mutex::new(FileLog {
                writer,
                live,
                lines,
            }),
        };

        if needs_rewrite {
            changelog.rewrite(&mut changelog.log.lock())?;
        }

        Ok(changelog)
    }

    /// Rewrite the file once more than `threshold` superseded entries exist.
    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold.max(1);
        self
    }

    /// Replace the file with the live entries and continue appending to it.
    fn rewrite(&self, log: &mut FileLog) -> Result<()> {
        let staging = self.path.with_extension("compacting");
        write_live(&staging, &self.path, &log.live)
            .map_err(|e| unavailable(&self.path, "compact", e))?;

        log.writer = BufWriter::new(open_append(&self.path)?);
        let before = log.lines;
        log.lines = log.live.len();

        debug!(
            path = %self.path.display(),
            before,
            after = log.lines,
            "Compacted changelog"
        );
        Ok(())
    }
}

impl ChangelogBackend for FileChangelog {
    fn append(&self, key: u32, entry: &[u8]) -> Result<()> {
        let mut log = self.log.lock();
        log.writer
            .write_all(entry)
            .and_then(|_| log.writer.write_all(b"\n"))
            .map_err(|e| unavailable(&self.path, "append", e))?;

        log.live.insert(key, entry.to_vec());
        log.lines += 1;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let mut log = self.log.lock();
        log.writer
            .flush()
            .and_then(|_| log.writer.get_ref().sync_data())
            .map_err(|e| unavailable(&self.path, "sync", e))?;

        if log.superseded() >= self.compaction_threshold {
            self.rewrite(&mut log)?;
        }
        Ok(())
    }

    fn entries(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.log.lock().live.values().cloned().collect())
    }
}

/// Read the live entry per key. The flag reports a torn tail.
fn load(path: &Path) -> Result<(BTreeMap<u32, Vec<u8>>, usize, bool)> {
    let mut live = BTreeMap::new();
    let mut lines = 0;

    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((live, lines, false)),
        Err(e) => return Err(unavailable(path, "read", e)),
    };

    for line in BufReader::new(file).split(b'\n') {
        let line = line.map_err(|e| unavailable(path, "read", e))?;
        if line.is_empty() {
            continue;
        }

        match serde_json::from_slice::<EntryKey>(&line) {
            Ok(entry) => {
                live.insert(entry.key, line);
                lines += 1;
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    recovered = lines,
                    error = %e,
                    "Discarding torn changelog tail"
                );
                return Ok((live, lines, true));
            }
        }
    }

    Ok((live, lines, false))
}

fn write_live(staging: &Path, target: &Path, live: &BTreeMap<u32, Vec<u8>>) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(staging)?);
    for entry in live.values() {
        out.write_all(entry)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    out.get_ref().sync_data()?;
    fs::rename(staging, target)
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| unavailable(path, "open", e))
}

fn unavailable(path: &Path, action: &str, err: io::Error) -> ProcessingError {
    ProcessingError::StoreUnavailable(format!("{} {}: {}", action, path.display(), err))
}

/// In-memory changelog with fault injection for exercising failure paths.
///
/// Holds only the live entry per key.
#[derive(Default)]
pub struct MemoryChangelog {
    entries: Mutex<BTreeMap<u32, Vec<u8>>>,
    unavailable: AtomicBool,
    failing_appends: AtomicUsize,
    sync_count: AtomicUsize,
}

impl MemoryChangelog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every operation until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `count` appends, then recover.
    pub fn fail_next_appends(&self, count: usize) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    /// Number of keys with a live entry.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sync_count(&self) -> usize {
        self.sync_count.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProcessingError::StoreUnavailable(
                "in-memory changelog marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

impl ChangelogBackend for MemoryChangelog {
    fn append(&self, key: u32, entry: &[u8]) -> Result<()> {
        self.check_available()?;

        let consumed = self
            .failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(ProcessingError::StoreUnavailable(
                "injected append failure".to_string(),
            ));
        }

        self.entries.lock().insert(key, entry.to_vec());
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.check_available()?;
        self.sync_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<Vec<u8>>> {
        self.check_available()?;
        Ok(self.entries.lock().values().cloned().collect())
    }
}

#[derive(Serialize, Deserialize)]
struct ChangelogEntry<V> {
    key: u32,
    value: V,
}

/// Typed view over a changelog backend.
pub struct Changelog<V> {
    backend: Arc<dyn ChangelogBackend>,
    _value: PhantomData<fn() -> V>,
}

impl<V> Changelog<V>
where
    V: Serialize + DeserializeOwned,
{
    pub fn new(backend: Arc<dyn ChangelogBackend>) -> Self {
        Self {
            backend,
            _value: PhantomData,
        }
    }

    pub fn append(&self, key: u32, value: &V) -> Result<()> {
        let encoded = serde_json::to_vec(&ChangelogEntry { key, value })?;
        self.backend.append(key, &encoded)
    }

    pub fn sync(&self) -> Result<()> {
        self.backend.sync()
    }

    /// Decode the live entry of every key.
    ///
    /// An entry whose value no longer decodes is skipped; other keys are
    /// unaffected.
    pub fn replay(&self) -> Result<Vec<(u32, V)>> {
        let raw = self.backend.entries()?;
        let mut decoded = Vec::with_capacity(raw.len());
        let mut skipped = 0;

        for bytes in raw {
            match serde_json::from_slice::<ChangelogEntry<V>>(&bytes) {
                Ok(entry) => decoded.push((entry.key, entry.value)),
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable changelog entry");
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            info!(recovered = decoded.len(), skipped, "Replayed changelog with skipped entries");
        } else {
            debug!(entries = decoded.len(), "Replayed changelog");
        }
        Ok(decoded)
    }
}
