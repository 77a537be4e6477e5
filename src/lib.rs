//! # LogKeeper
//!
//! LogKeeper is a rolling log file sink: it appends opaque byte records to a
//! primary log file and transparently rotates that file to a timestamped
//! backup once it would grow past a configured size. Rotated backups are
//! retained up to a configurable count and age, and can be gzip-compressed in
//! the background without blocking the write path. **LogKeeper integrates
//! seamlessly as a writer for the tracing crate** via
//! `tracing_appender::non_blocking`, or anywhere else an [`std::io::Write`]
//! is accepted.
//!
//! The directory listing is the only index of past rotations: every backup
//! carries its rotation time in its file name
//! (`app-2025-04-01T19-55-03.412.log`, plus `.gz` once compressed), and
//! retention re-derives the backup set from the directory on every pass. No
//! sidecar state means a sink can be pointed at a directory written by an
//! earlier run and pick retention and interrupted compression back up where
//! they left off.
//!
//! ## Example
//!
//! ```rust,no_run
//! use {logkeeper::LogKeeper, std::io::Write as _};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut sink = LogKeeper::builder("./logs/app.log")
//!         .max_bytes(10 * 1024 * 1024) // rotate at 10 MiB
//!         .max_backups(5)              // keep the five newest backups
//!         .max_age_days(28)            // and nothing older than four weeks
//!         .compress(true)              // gzip backups in the background
//!         .build()?;
//!
//!     writeln!(sink, "service started")?;
//!     Ok(())
//! }
//! ```
use {
    chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone as _, Utc},
    flate2::write::GzEncoder,
    regex::Regex,
    std::{
        collections::{btree_map, BTreeMap},
        env,
        ffi::{OsStr, OsString},
        fs::{self, File, OpenOptions},
        io::{self, Write as _},
        path::{Path, PathBuf},
        sync::{
            mpsc::{self, Receiver, SyncSender},
            Arc, Mutex, PoisonError,
        },
        thread::{self, JoinHandle},
    },
};

#[cfg(unix)]
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};

/// Timestamp layout embedded in backup file names. Colons are replaced with
/// hyphens so the names stay path-safe on every platform; precision is fixed
/// at milliseconds.
const BACKUP_TIME_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3f";

/// Suffix appended to a backup once it has been gzip-compressed.
const COMPRESS_SUFFIX: &str = ".gz";

/// Size bound applied when the configuration leaves `max_bytes` at zero.
const DEFAULT_MAX_BYTES: u64 = 100 * 1024 * 1024;

/// Mode for active files the sink creates itself.
#[cfg(unix)]
const DEFAULT_FILE_MODE: u32 = 0o600;

/// Source of the wall clock used to name backups and judge their age.
///
/// The sink reads the clock exactly once per rotation and once per retention
/// pass. Taking it as a constructor parameter (rather than calling
/// [`Utc::now`] directly) lets tests drive rotation deterministically by
/// advancing a manual clock.
pub trait Clock: Send + Sync {
    /// The current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// The default [`Clock`], backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Numeric owner of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOwner {
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
}

/// Filesystem calls the sink uses to carry file ownership across rotation
/// and compression.
///
/// Rotation renames the active file away and creates a replacement; the
/// replacement (and any compressed copy of a backup) should belong to the
/// same owner as the original. The default [`OsFileOps`] talks to the
/// operating system; tests substitute a recording fake so ownership handling
/// can be exercised without running as root.
pub trait FileOps: Send + Sync {
    /// Owner of the file at `path`, or `None` where the platform has no
    /// notion of one.
    fn owner(&self, path: &Path) -> io::Result<Option<FileOwner>>;

    /// Assign `owner` to the file at `path`.
    fn chown(&self, path: &Path, owner: FileOwner) -> io::Result<()>;
}

/// The default [`FileOps`], backed by the operating system.
///
/// Ownership is a Unix concept; on other platforms [`owner`](FileOps::owner)
/// reports `None` and [`chown`](FileOps::chown) is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileOps;

#[cfg(unix)]
impl FileOps for OsFileOps {
    fn owner(&self, path: &Path) -> io::Result<Option<FileOwner>> {
        let metadata = fs::metadata(path)?;
        Ok(Some(FileOwner {
            uid: metadata.uid(),
            gid: metadata.gid(),
        }))
    }

    fn chown(&self, path: &Path, owner: FileOwner) -> io::Result<()> {
        std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid))
    }
}

#[cfg(not(unix))]
impl FileOps for OsFileOps {
    fn owner(&self, _path: &Path) -> io::Result<Option<FileOwner>> {
        Ok(None)
    }

    fn chown(&self, _path: &Path, _owner: FileOwner) -> io::Result<()> {
        Ok(())
    }
}

/// Settings for a [`LogKeeper`].
///
/// The struct is plain data so a host can decode it from whatever
/// configuration format it already uses. With the `serde` feature (on by
/// default) it derives `Deserialize` under the traditional field names:
///
/// ```toml
/// filename = "/var/log/myapp/app.log"
/// maxbytes = 10485760
/// maxage = 28
/// maxbackups = 5
/// localtime = false
/// compress = true
/// ```
///
/// Every field has a zero default, and zero always means "pick the default
/// behavior" (see the field docs), so partial documents decode cleanly.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct Config {
    /// Path of the active log file. Backups are written next to it. Empty
    /// selects `<temp-dir>/<program-name>-rolling.log`.
    #[cfg_attr(feature = "serde", serde(default))]
    pub filename: PathBuf,

    /// Size in bytes the active file may reach before it is rotated. Zero
    /// selects 100 MiB. A single record longer than this is rejected rather
    /// than rotated around.
    #[cfg_attr(feature = "serde", serde(default, rename = "maxbytes"))]
    pub max_bytes: u64,

    /// Maximum age in days of any retained backup, judged by the timestamp
    /// in its file name. Zero retains backups regardless of age.
    #[cfg_attr(feature = "serde", serde(default, rename = "maxage"))]
    pub max_age_days: u64,

    /// Maximum number of retained backups, not counting the active file.
    /// Zero retains all of them.
    #[cfg_attr(feature = "serde", serde(default, rename = "maxbackups"))]
    pub max_backups: usize,

    /// Render backup timestamps in the local time zone instead of UTC.
    #[cfg_attr(feature = "serde", serde(default, rename = "localtime"))]
    pub local_time: bool,

    /// Gzip-compress backups after rotation.
    #[cfg_attr(feature = "serde", serde(default))]
    pub compress: bool,
}

/// Errors surfaced by [`LogKeeper`].
///
/// Write-path failures come back from [`LogKeeper::append`] and friends;
/// [`Compression`](LogKeeperError::Compression) and
/// [`Cleanup`](LogKeeperError::Cleanup) only ever reach the background error
/// hook, never a writer.
#[derive(Debug, thiserror::Error)]
pub enum LogKeeperError {
    /// A single record was longer than the configured file size bound.
    #[error("write length {len} exceeds maximum file size {max}")]
    WriteTooLarge {
        /// Length of the rejected record.
        len: u64,
        /// Effective size bound of the active file.
        max: u64,
    },
    /// A filesystem operation on the write path failed.
    #[error("failed to {op} '{path}'")]
    Io {
        /// What the sink was doing.
        op: &'static str,
        /// The file or directory it was doing it to.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The active log file could not be opened or created.
    #[error("failed to open active log file '{path}'")]
    OpenActive {
        /// Path of the active file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// A backup could not be compressed. Background only; the uncompressed
    /// source is left in place for the next pass.
    #[error("failed to compress backup '{path}'")]
    Compression {
        /// Path of the backup being compressed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// An obsolete backup could not be removed. Background only.
    #[error("failed to remove backup '{path}'")]
    Cleanup {
        /// Path of the backup being removed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Invariant violation inside the sink.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<LogKeeperError> for io::Error {
    fn from(err: LogKeeperError) -> Self {
        let kind = match &err {
            LogKeeperError::WriteTooLarge { .. } => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// Hook invoked for every error the background worker swallows.
type ErrorHook = Arc<dyn Fn(&LogKeeperError) + Send + Sync>;

/// Derives backup file names from the active file's path and recognizes them
/// again when scanning the log directory.
///
/// For `/var/log/myapp/app.log` the backups are
/// `/var/log/myapp/app-<timestamp>.log`, optionally followed by `.gz`. The
/// timestamp middle doubles as the persistent index of past rotations, so
/// parsing is strict: anything that does not match the pattern exactly is
/// not a backup of this log and is never touched.
#[derive(Debug, Clone)]
struct NamePattern {
    dir: PathBuf,
    prefix: String,
    ext: String,
    local_time: bool,
    pattern: Regex,
}

impl NamePattern {
    fn new(filename: &Path, local_time: bool) -> Result<Self, LogKeeperError> {
        let name = filename
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = filename
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let prefix = name[..name.len() - ext.len()].to_string();
        let dir = filename.parent().map(Path::to_path_buf).unwrap_or_default();
        let pattern = Regex::new(&format!(
            r"^{}-(\d{{4}}-\d{{2}}-\d{{2}}T\d{{2}}-\d{{2}}-\d{{2}}\.\d{{3}}){}(\.gz)?$",
            regex::escape(&prefix),
            regex::escape(&ext),
        ))
        .map_err(|err| LogKeeperError::Internal(err.to_string()))?;
        Ok(NamePattern {
            dir,
            prefix,
            ext,
            local_time,
            pattern,
        })
    }

    /// Backup path for a rotation happening at `now`.
    fn backup_path(&self, now: DateTime<Utc>) -> PathBuf {
        let timestamp = if self.local_time {
            now.with_timezone(&Local)
                .format(BACKUP_TIME_FORMAT)
                .to_string()
        } else {
            now.format(BACKUP_TIME_FORMAT).to_string()
        };
        self.dir
            .join(format!("{}-{}{}", self.prefix, timestamp, self.ext))
    }

    /// Parse a directory entry name into its rotation time and whether the
    /// entry is compressed. `None` means the entry is not a backup of this
    /// log.
    fn parse(&self, file_name: &str) -> Option<(DateTime<Utc>, bool)> {
        let caps = self.pattern.captures(file_name)?;
        let naive = NaiveDateTime::parse_from_str(&caps[1], BACKUP_TIME_FORMAT).ok()?;
        let compressed = caps.get(2).is_some();
        let timestamp = if self.local_time {
            // Names rendered in local time carry no offset; interpret them
            // in the local zone, falling back to UTC across a DST gap.
            Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|local| local.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
        } else {
            Utc.from_utc_datetime(&naive)
        };
        Some((timestamp, compressed))
    }
}

/// A rotated log file found in the log directory.
#[derive(Debug, Clone)]
struct Backup {
    /// Path retention accounts for. When both a plain and a `.gz` form of
    /// the same timestamp exist, this is the `.gz` side.
    path: PathBuf,
    /// Rotation time parsed from the file name.
    timestamp: DateTime<Utc>,
    /// Whether `path` is already compressed.
    compressed: bool,
    /// Plain twin of a compressed entry, left over from an interrupted
    /// compression. Never counted or deleted by retention.
    pending_source: Option<PathBuf>,
}

/// Gzip work still owed for a backup.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CompressJob {
    source: PathBuf,
    destination: PathBuf,
}

/// Outcome of one retention pass over the backup list.
#[derive(Debug, Default)]
struct RetentionPlan {
    /// Backups to delete.
    remove: Vec<Backup>,
    /// Backups to keep, newest first.
    keep: Vec<Backup>,
    /// Compression still owed for kept backups.
    compress: Vec<CompressJob>,
}

/// Partition `backups` (sorted newest first) according to the retention
/// policy: cap the count, then expire by age, then schedule gzip work for
/// whatever survives.
fn plan_retention(
    mut backups: Vec<Backup>,
    max_backups: usize,
    max_age_days: u64,
    compress: bool,
    now: DateTime<Utc>,
) -> RetentionPlan {
    let mut plan = RetentionPlan::default();
    if max_backups > 0 && backups.len() > max_backups {
        plan.remove = backups.split_off(max_backups);
    }
    if max_age_days > 0 {
        let cutoff = now - Duration::days(max_age_days as i64);
        let (kept, expired): (Vec<Backup>, Vec<Backup>) = backups
            .into_iter()
            .partition(|backup| backup.timestamp >= cutoff);
        backups = kept;
        plan.remove.extend(expired);
    }
    for backup in backups {
        if compress {
            if let Some(source) = &backup.pending_source {
                // Finish a compression a previous run never completed.
                plan.compress.push(CompressJob {
                    source: source.clone(),
                    destination: backup.path.clone(),
                });
            } else if !backup.compressed {
                plan.compress.push(CompressJob {
                    source: backup.path.clone(),
                    destination: gz_path(&backup.path),
                });
            }
        }
        plan.keep.push(backup);
    }
    plan
}

/// `path` with the gzip suffix appended.
fn gz_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(COMPRESS_SUFFIX);
    PathBuf::from(name)
}

/// `<temp-dir>/<program-name>-rolling.log`, used when no filename is
/// configured.
fn default_filename() -> PathBuf {
    let mut name = env::current_exe()
        .ok()
        .and_then(|exe| exe.file_name().map(OsStr::to_os_string))
        .unwrap_or_else(|| OsString::from("logkeeper"));
    name.push("-rolling.log");
    env::temp_dir().join(name)
}

/// Message to the background worker.
enum Request {
    /// Run one cleanup pass.
    Clean,
    /// Run one cleanup pass, then acknowledge. Lets callers wait for worker
    /// quiescence.
    Sync(SyncSender<()>),
}

/// Handle to the background worker.
struct Worker {
    tx: SyncSender<Request>,
    handle: JoinHandle<()>,
}

/// Background task: one cleanup pass per request, exiting once the sink
/// closes the channel and the queue drains.
fn worker_loop(shared: Arc<Shared>, requests: Receiver<Request>) {
    for request in requests {
        shared.run_cleanup();
        if let Request::Sync(done) = request {
            let _ = done.send(());
        }
    }
}

/// Configuration and collaborators shared between the writer and the
/// background worker. Immutable once the sink is built.
struct Shared {
    filename: PathBuf,
    max_bytes: u64,
    max_backups: usize,
    max_age_days: u64,
    compress: bool,
    pattern: NamePattern,
    clock: Arc<dyn Clock>,
    file_ops: Arc<dyn FileOps>,
    on_error: Option<ErrorHook>,
}

impl Shared {
    /// List this log's backups, newest first.
    ///
    /// Directory entries that do not decode, directories whose names happen
    /// to match, and the active file are skipped. When both `X` and `X.gz`
    /// exist for one timestamp the pair collapses into a single entry for
    /// the `.gz` side, with the plain side remembered as its pending
    /// compression source.
    fn list_backups(&self) -> Result<Vec<Backup>, LogKeeperError> {
        let dir = if self.pattern.dir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            self.pattern.dir.as_path()
        };
        let entries = fs::read_dir(dir).map_err(|err| LogKeeperError::Io {
            op: "list log directory",
            path: dir.to_path_buf(),
            source: err,
        })?;
        let active = self.filename.file_name();

        let mut by_time: BTreeMap<DateTime<Utc>, Backup> = BTreeMap::new();
        for entry in entries.flatten() {
            if entry.file_type().map(|kind| kind.is_dir()).unwrap_or(true) {
                continue;
            }
            let name = entry.file_name();
            if Some(name.as_os_str()) == active {
                continue;
            }
            let Some(name) = name.to_str() else { continue };
            let Some((timestamp, compressed)) = self.pattern.parse(name) else {
                continue;
            };
            let path = entry.path();
            match by_time.entry(timestamp) {
                btree_map::Entry::Vacant(slot) => {
                    slot.insert(Backup {
                        path,
                        timestamp,
                        compressed,
                        pending_source: None,
                    });
                }
                btree_map::Entry::Occupied(mut slot) => {
                    let existing = slot.get_mut();
                    if compressed && !existing.compressed {
                        existing.pending_source =
                            Some(std::mem::replace(&mut existing.path, path));
                        existing.compressed = true;
                    } else if !compressed && existing.compressed {
                        existing.pending_source = Some(path);
                    }
                }
            }
        }
        Ok(by_time.into_values().rev().collect())
    }

    /// One pass of the retention policy: scan, plan, delete, compress.
    fn run_cleanup(&self) {
        let backups = match self.list_backups() {
            Ok(backups) => backups,
            Err(err) => {
                self.report(&err);
                return;
            }
        };
        let plan = plan_retention(
            backups,
            self.max_backups,
            self.max_age_days,
            self.compress,
            self.clock.now(),
        );
        for backup in &plan.remove {
            if let Err(err) = fs::remove_file(&backup.path) {
                self.report(&LogKeeperError::Cleanup {
                    path: backup.path.clone(),
                    source: err,
                });
            }
        }
        for job in &plan.compress {
            if let Err(err) = self.compress_backup(&job.source, &job.destination) {
                self.report(&err);
            }
        }
    }

    /// Gzip `source` into `destination`, carrying mode and ownership over,
    /// then remove `source`. A failed attempt removes the partial
    /// destination and leaves `source` untouched for the next pass.
    fn compress_backup(&self, source: &Path, destination: &Path) -> Result<(), LogKeeperError> {
        let as_error = |err: io::Error| LogKeeperError::Compression {
            path: source.to_path_buf(),
            source: err,
        };
        let metadata = fs::metadata(source).map_err(as_error)?;
        let owner = self.file_ops.owner(source).map_err(as_error)?;

        let written = (|| -> io::Result<()> {
            let mut reader = io::BufReader::new(File::open(source)?);
            let out = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(destination)?;
            out.set_permissions(metadata.permissions())?;
            if let Some(owner) = owner {
                self.file_ops.chown(destination, owner)?;
            }
            let mut encoder =
                GzEncoder::new(io::BufWriter::new(out), flate2::Compression::default());
            io::copy(&mut reader, &mut encoder)?;
            let mut out = encoder.finish()?;
            out.flush()?;
            Ok(())
        })();

        if let Err(err) = written {
            let _ = fs::remove_file(destination);
            return Err(as_error(err));
        }
        fs::remove_file(source).map_err(as_error)?;
        Ok(())
    }

    /// Route a background failure to the error hook; retention keeps going.
    fn report(&self, err: &LogKeeperError) {
        tracing::warn!(error = %err, "background log maintenance failed");
        if let Some(hook) = &self.on_error {
            hook(err);
        }
    }
}

/// State behind the writer lock.
struct Inner {
    /// Open handle to the active file, absent until the first write and
    /// after a failed rotation.
    file: Option<File>,
    /// On-disk length of the active file: its size when opened plus every
    /// byte written since.
    size: u64,
    /// Background worker, spawned on first use.
    worker: Option<Worker>,
}

/// A rolling log file sink.
///
/// `LogKeeper` appends byte records to its configured file and rotates the
/// file to a timestamped backup once a record would push it past the size
/// bound. Deleting and compressing old backups happens on a background
/// thread, so writes never wait on retention.
///
/// The sink serializes concurrent callers internally; [`std::io::Write`] is
/// implemented for both `LogKeeper` and `&LogKeeper`, so one sink can be
/// shared across threads behind an [`Arc`].
///
/// The first write opens the file (appending to an existing one that is
/// still under the size bound, rotating it first if it is not), and a
/// dropped or [`close`](LogKeeper::close)d sink shuts the background worker
/// down after letting it finish outstanding work.
pub struct LogKeeper {
    shared: Arc<Shared>,
    inner: Mutex<Inner>,
}

impl LogKeeper {
    /// Sink for `filename` with default settings: 100 MiB bound, unlimited
    /// backups of unbounded age, UTC names, no compression.
    pub fn new(filename: impl AsRef<Path>) -> Result<Self, LogKeeperError> {
        LogKeeperBuilder::new(filename).build()
    }

    /// Start configuring a sink for `filename`.
    pub fn builder(filename: impl AsRef<Path>) -> LogKeeperBuilder {
        LogKeeperBuilder::new(filename)
    }

    /// Path of the active log file.
    pub fn path(&self) -> &Path {
        &self.shared.filename
    }

    /// Append one record to the active log file, returning how many bytes
    /// were persisted.
    ///
    /// Opens the file on first use and rotates when the record would push it
    /// past the size bound. A record longer than the bound itself is
    /// rejected with [`LogKeeperError::WriteTooLarge`] and nothing is
    /// written. A short write is reported as such and not retried.
    pub fn append(&self, record: &[u8]) -> Result<usize, LogKeeperError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let len = record.len() as u64;
        if len > self.shared.max_bytes {
            return Err(LogKeeperError::WriteTooLarge {
                len,
                max: self.shared.max_bytes,
            });
        }
        if inner.file.is_none() {
            self.open_existing_or_new(&mut inner)?;
        }
        if inner.size + len > self.shared.max_bytes {
            self.rotate_now(&mut inner)?;
        }
        let file = inner
            .file
            .as_mut()
            .ok_or_else(|| LogKeeperError::Internal("no active file after open".to_string()))?;
        let written = file.write(record).map_err(|err| LogKeeperError::Io {
            op: "write to",
            path: self.shared.filename.clone(),
            source: err,
        })?;
        inner.size += written as u64;
        Ok(written)
    }

    /// Force a rotation regardless of the active file's size.
    ///
    /// Useful together with an external trigger (a signal handler, a timer)
    /// to start a new log file on demand. With no active file this simply
    /// creates a fresh empty one.
    pub fn rotate(&self) -> Result<(), LogKeeperError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.rotate_now(&mut inner)
    }

    /// Flush the active file handle, if one is open.
    pub fn flush(&self) -> Result<(), LogKeeperError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(file) = inner.file.as_mut() {
            file.flush().map_err(|err| LogKeeperError::Io {
                op: "flush",
                path: self.shared.filename.clone(),
                source: err,
            })?;
        }
        Ok(())
    }

    /// Block until the background worker has completed a full cleanup pass.
    ///
    /// Backups are deleted and compressed behind the write path, so a caller
    /// that has just observed a successful rotation may still see the
    /// pre-rotation directory contents. After this returns, the retention
    /// effects of every earlier rotation are visible. Returns immediately if
    /// the worker was never started.
    pub fn flush_background(&self) {
        let tx = {
            let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            match &inner.worker {
                Some(worker) => worker.tx.clone(),
                None => return,
            }
        };
        let (ack, done) = mpsc::sync_channel(1);
        // A round-trip request must not be dropped, so block for queue space
        // instead of using the write path's try_send.
        if tx.send(Request::Sync(ack)).is_ok() {
            let _ = done.recv();
        }
    }

    /// Close the active file and shut the background worker down, letting it
    /// drain any pending cleanup request first.
    ///
    /// The sink stays usable: a later write reopens the file and restarts
    /// the worker. Dropping the sink performs the same shutdown.
    pub fn close(&self) -> Result<(), LogKeeperError> {
        let (flushed, worker) = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let flushed = match inner.file.as_mut() {
                Some(file) => file.flush().map_err(|err| LogKeeperError::Io {
                    op: "flush",
                    path: self.shared.filename.clone(),
                    source: err,
                }),
                None => Ok(()),
            };
            inner.file = None;
            (flushed, inner.worker.take())
        };
        if let Some(worker) = worker {
            drop(worker.tx);
            let _ = worker.handle.join();
        }
        flushed
    }

    /// Open the configured file for appending, or produce a fresh one if it
    /// is missing, unreadable, or already at the size bound.
    fn open_existing_or_new(&self, inner: &mut Inner) -> Result<(), LogKeeperError> {
        // A sink may be pointed at a directory an earlier run left behind;
        // kick off retention so stale backups and half-finished compression
        // get handled even before the first rotation.
        self.post_cleanup(inner);

        let filename = &self.shared.filename;
        let metadata = match fs::metadata(filename) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return self.open_new(inner),
            Err(err) => {
                return Err(LogKeeperError::Io {
                    op: "stat",
                    path: filename.clone(),
                    source: err,
                })
            }
        };
        if metadata.len() >= self.shared.max_bytes {
            return self.rotate_now(inner);
        }
        match OpenOptions::new().append(true).open(filename) {
            Ok(file) => {
                inner.file = Some(file);
                inner.size = metadata.len();
                Ok(())
            }
            // If the existing file can't be appended to, rotate it aside and
            // start fresh.
            Err(_) => self.open_new(inner),
        }
    }

    /// Swap the active file for a timestamped backup, start over empty, and
    /// schedule retention.
    fn rotate_now(&self, inner: &mut Inner) -> Result<(), LogKeeperError> {
        self.open_new(inner)?;
        tracing::debug!(path = %self.shared.filename.display(), "rotated log file");
        self.post_cleanup(inner);
        Ok(())
    }

    /// Produce a fresh active file. An existing file is renamed to a backup
    /// named for the current time, and its mode and ownership carry over to
    /// the replacement.
    fn open_new(&self, inner: &mut Inner) -> Result<(), LogKeeperError> {
        inner.file = None;

        let shared = &self.shared;
        let filename = &shared.filename;
        if let Some(parent) = filename.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| LogKeeperError::Io {
                    op: "create log directory",
                    path: parent.to_path_buf(),
                    source: err,
                })?;
            }
        }

        let mut previous = None;
        if let Ok(metadata) = fs::metadata(filename) {
            let owner = shared.file_ops.owner(filename).ok().flatten();
            // The backup's name is the rotation time, taken once.
            let backup = shared.pattern.backup_path(shared.clock.now());
            fs::rename(filename, &backup).map_err(|err| LogKeeperError::Io {
                op: "rename",
                path: filename.clone(),
                source: err,
            })?;
            previous = Some((metadata.permissions(), owner));
        }

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(DEFAULT_FILE_MODE);
        let file = options
            .open(filename)
            .map_err(|err| LogKeeperError::OpenActive {
                path: filename.clone(),
                source: err,
            })?;

        if let Some((permissions, owner)) = previous {
            file.set_permissions(permissions)
                .map_err(|err| LogKeeperError::Io {
                    op: "set permissions on",
                    path: filename.clone(),
                    source: err,
                })?;
            if let Some(owner) = owner {
                shared
                    .file_ops
                    .chown(filename, owner)
                    .map_err(|err| LogKeeperError::Io {
                        op: "chown",
                        path: filename.clone(),
                        source: err,
                    })?;
            }
        }

        inner.file = Some(file);
        inner.size = 0;
        Ok(())
    }

    /// Hand the worker a cleanup request without blocking the write path.
    ///
    /// The queue holds at most one pending request and a pending request
    /// will re-scan everything anyway, so a full queue drops the new request
    /// instead of waiting.
    fn post_cleanup(&self, inner: &mut Inner) {
        if inner.worker.is_none() {
            let (tx, rx) = mpsc::sync_channel(1);
            let shared = Arc::clone(&self.shared);
            match thread::Builder::new()
                .name("logkeeper-cleanup".to_string())
                .spawn(move || worker_loop(shared, rx))
            {
                Ok(handle) => inner.worker = Some(Worker { tx, handle }),
                Err(err) => {
                    self.shared.report(&LogKeeperError::Cleanup {
                        path: self.shared.filename.clone(),
                        source: err,
                    });
                    return;
                }
            }
        }
        if let Some(worker) = &inner.worker {
            let _ = worker.tx.try_send(Request::Clean);
        }
    }
}

impl Drop for LogKeeper {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl io::Write for LogKeeper {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        LogKeeper::flush(self).map_err(io::Error::from)
    }
}

/// Shared-reference writer, so parallel callers can log through one sink;
/// the internal lock serializes them.
impl io::Write for &LogKeeper {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        LogKeeper::flush(*self).map_err(io::Error::from)
    }
}

/// Configures and creates a [`LogKeeper`].
///
/// Every knob has a usable default; `build` performs no I/O, the file is
/// opened by the first write.
///
/// # Examples
///
/// ```rust,no_run
/// use logkeeper::LogKeeper;
///
/// let sink = LogKeeper::builder("./logs/app.log")
///     .max_bytes(50 * 1024 * 1024)
///     .max_backups(10)
///     .local_time(true)
///     .compress(true)
///     .build()
///     .unwrap();
/// ```
///
/// Hosts that decode settings externally seed the builder from a [`Config`]:
///
/// ```rust,no_run
/// use logkeeper::{Config, LogKeeperBuilder};
///
/// # fn decode_from_somewhere() -> Config { Config::default() }
/// let config: Config = decode_from_somewhere();
/// let sink = LogKeeperBuilder::from_config(config).build().unwrap();
/// ```
pub struct LogKeeperBuilder {
    config: Config,
    clock: Arc<dyn Clock>,
    file_ops: Arc<dyn FileOps>,
    on_error: Option<ErrorHook>,
}

impl LogKeeperBuilder {
    /// Builder for a sink writing to `filename`.
    pub fn new(filename: impl AsRef<Path>) -> Self {
        Self::from_config(Config {
            filename: filename.as_ref().to_path_buf(),
            ..Config::default()
        })
    }

    /// Builder seeded from an externally decoded [`Config`].
    pub fn from_config(config: Config) -> Self {
        LogKeeperBuilder {
            config,
            clock: Arc::new(SystemClock),
            file_ops: Arc::new(OsFileOps),
            on_error: None,
        }
    }

    /// Size in bytes the active file may reach before rotation. Zero selects
    /// 100 MiB.
    pub fn max_bytes(mut self, max_bytes: u64) -> Self {
        self.config.max_bytes = max_bytes;
        self
    }

    /// Maximum number of retained backups. Zero retains all of them.
    pub fn max_backups(mut self, max_backups: usize) -> Self {
        self.config.max_backups = max_backups;
        self
    }

    /// Maximum age in days of any retained backup. Zero retains backups
    /// regardless of age.
    pub fn max_age_days(mut self, max_age_days: u64) -> Self {
        self.config.max_age_days = max_age_days;
        self
    }

    /// Render backup timestamps in the local time zone instead of UTC.
    pub fn local_time(mut self, local_time: bool) -> Self {
        self.config.local_time = local_time;
        self
    }

    /// Gzip-compress backups after rotation.
    pub fn compress(mut self, compress: bool) -> Self {
        self.config.compress = compress;
        self
    }

    /// Wall-clock source used for backup names and age checks.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Filesystem hooks used to preserve file ownership across rotation and
    /// compression.
    pub fn file_ops(mut self, file_ops: impl FileOps + 'static) -> Self {
        self.file_ops = Arc::new(file_ops);
        self
    }

    /// Observe errors from the background worker.
    ///
    /// Deletion and compression failures never surface through the write
    /// path; they are logged at warn level and, when this hook is set,
    /// handed to it. The hook runs on the worker thread.
    pub fn on_background_error(
        mut self,
        hook: impl Fn(&LogKeeperError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Build the sink. No file is opened until the first write.
    pub fn build(self) -> Result<LogKeeper, LogKeeperError> {
        let Config {
            filename,
            max_bytes,
            max_age_days,
            max_backups,
            local_time,
            compress,
        } = self.config;
        let filename = if filename.as_os_str().is_empty() {
            default_filename()
        } else {
            filename
        };
        let max_bytes = if max_bytes == 0 {
            DEFAULT_MAX_BYTES
        } else {
            max_bytes
        };
        let pattern = NamePattern::new(&filename, local_time)?;
        Ok(LogKeeper {
            shared: Arc::new(Shared {
                filename,
                max_bytes,
                max_backups,
                max_age_days,
                compress,
                pattern,
                clock: self.clock,
                file_ops: self.file_ops,
                on_error: self.on_error,
            }),
            inner: Mutex::new(Inner {
                file: None,
                size: 0,
                worker: None,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;
    use tempfile::TempDir;

    fn ts(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
        second: u32,
        milli: i64,
    ) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
            .unwrap()
            + Duration::milliseconds(milli)
    }

    fn backup(path: &str, timestamp: DateTime<Utc>) -> Backup {
        Backup {
            path: PathBuf::from(path),
            timestamp,
            compressed: path.ends_with(COMPRESS_SUFFIX),
            pending_source: None,
        }
    }

    #[test]
    fn backup_name_round_trip() {
        let pattern = NamePattern::new(Path::new("/var/log/myfoo/foo.log"), false).unwrap();
        let when = ts(2014, 5, 4, 14, 44, 33, 555);

        let path = pattern.backup_path(when);
        assert_eq!(
            path,
            PathBuf::from("/var/log/myfoo/foo-2014-05-04T14-44-33.555.log")
        );

        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(pattern.parse(name), Some((when, false)));
        assert_eq!(
            pattern.parse("foo-2014-05-04T14-44-33.555.log.gz"),
            Some((when, true))
        );
    }

    #[test]
    fn backup_names_reject_foreign_files() {
        let pattern = NamePattern::new(Path::new("/var/log/myfoo/foo.log"), false).unwrap();

        // Missing extension, missing prefix, no timestamp at all, an
        // unrelated suffix, and a timestamp that is shaped right but is not
        // a real date.
        assert_eq!(pattern.parse("foo-2014-05-04T14-44-33.555"), None);
        assert_eq!(pattern.parse("2014-05-04T14-44-33.555.log"), None);
        assert_eq!(pattern.parse("foo.log"), None);
        assert_eq!(pattern.parse("foo.log.foo"), None);
        assert_eq!(pattern.parse("foo-2014-13-99T99-99-99.999.log"), None);
    }

    #[test]
    fn backup_names_without_extension() {
        let pattern = NamePattern::new(Path::new("/var/log/foo"), false).unwrap();
        let when = ts(2014, 5, 4, 14, 44, 33, 555);
        assert_eq!(
            pattern.backup_path(when),
            PathBuf::from("/var/log/foo-2014-05-04T14-44-33.555")
        );
        assert_eq!(
            pattern.parse("foo-2014-05-04T14-44-33.555"),
            Some((when, false))
        );
        assert_eq!(pattern.parse("foo-2014-05-04T14-44-33.555.log"), None);
    }

    #[test]
    fn retention_caps_backup_count() {
        let now = ts(2025, 4, 3, 12, 0, 0, 0);
        let backups = vec![
            backup("/t/foo-3.log", now - Duration::hours(1)),
            backup("/t/foo-2.log", now - Duration::hours(2)),
            backup("/t/foo-1.log", now - Duration::hours(3)),
        ];
        let plan = plan_retention(backups, 2, 0, false, now);
        assert_eq!(plan.keep.len(), 2);
        assert_eq!(plan.remove.len(), 1);
        assert_eq!(plan.remove[0].path, PathBuf::from("/t/foo-1.log"));
        assert!(plan.compress.is_empty());
    }

    #[test]
    fn retention_expires_old_backups() {
        let now = ts(2025, 4, 3, 12, 0, 0, 0);
        let backups = vec![
            backup("/t/foo-new.log", now - Duration::hours(12)),
            backup("/t/foo-old.log", now - Duration::days(2)),
        ];
        let plan = plan_retention(backups, 0, 1, false, now);
        assert_eq!(plan.keep.len(), 1);
        assert_eq!(plan.keep[0].path, PathBuf::from("/t/foo-new.log"));
        assert_eq!(plan.remove.len(), 1);
        assert_eq!(plan.remove[0].path, PathBuf::from("/t/foo-old.log"));
    }

    #[test]
    fn retention_zero_limits_keep_everything() {
        let now = ts(2025, 4, 3, 12, 0, 0, 0);
        let backups = vec![
            backup("/t/foo-b.log", now - Duration::days(400)),
            backup("/t/foo-a.log", now - Duration::days(800)),
        ];
        let plan = plan_retention(backups, 0, 0, false, now);
        assert_eq!(plan.keep.len(), 2);
        assert!(plan.remove.is_empty());
    }

    #[test]
    fn retention_marks_survivors_for_compression() {
        let now = ts(2025, 4, 3, 12, 0, 0, 0);
        let backups = vec![
            backup("/t/foo-new.log", now - Duration::hours(1)),
            backup("/t/foo-done.log.gz", now - Duration::hours(2)),
            backup("/t/foo-old.log", now - Duration::hours(3)),
        ];
        let plan = plan_retention(backups, 2, 0, true, now);
        // The oldest plain file fell to the count cap; only the surviving
        // plain file owes compression.
        assert_eq!(plan.remove.len(), 1);
        assert_eq!(plan.remove[0].path, PathBuf::from("/t/foo-old.log"));
        assert_eq!(
            plan.compress,
            vec![CompressJob {
                source: PathBuf::from("/t/foo-new.log"),
                destination: PathBuf::from("/t/foo-new.log.gz"),
            }]
        );
    }

    #[test]
    fn retention_finishes_interrupted_compression() {
        let now = ts(2025, 4, 3, 12, 0, 0, 0);
        let mut pair = backup("/t/foo-x.log.gz", now - Duration::hours(1));
        pair.pending_source = Some(PathBuf::from("/t/foo-x.log"));
        let plan = plan_retention(vec![pair], 1, 0, true, now);
        assert_eq!(plan.keep.len(), 1);
        assert!(plan.remove.is_empty());
        assert_eq!(
            plan.compress,
            vec![CompressJob {
                source: PathBuf::from("/t/foo-x.log"),
                destination: PathBuf::from("/t/foo-x.log.gz"),
            }]
        );
    }

    #[test]
    fn scanner_collapses_pairs_and_skips_strangers() {
        let dir = TempDir::new().unwrap();
        let file = |name: &str| fs::write(dir.path().join(name), b"x").unwrap();

        file("foobar.log"); // active
        file("foobar-2025-04-01T10-00-00.000.log");
        file("foobar-2025-04-02T10-00-00.000.log");
        file("foobar-2025-04-02T10-00-00.000.log.gz"); // compression in progress
        file("foobar-2025-04-03T10-00-00.000.log.gz");
        file("foobar.log.foo"); // unrelated sibling
        // A directory whose name matches the backup pattern exactly.
        fs::create_dir(dir.path().join("foobar-2025-04-04T10-00-00.000.log")).unwrap();

        let keeper = LogKeeper::builder(dir.path().join("foobar.log"))
            .build()
            .unwrap();
        let backups = keeper.shared.list_backups().unwrap();

        assert_eq!(backups.len(), 3);
        // Newest first.
        assert_eq!(backups[0].timestamp, ts(2025, 4, 3, 10, 0, 0, 0));
        assert!(backups[0].compressed);
        assert_eq!(backups[1].timestamp, ts(2025, 4, 2, 10, 0, 0, 0));
        assert!(backups[1].compressed);
        assert_eq!(
            backups[1].pending_source,
            Some(dir.path().join("foobar-2025-04-02T10-00-00.000.log"))
        );
        assert_eq!(backups[2].timestamp, ts(2025, 4, 1, 10, 0, 0, 0));
        assert!(!backups[2].compressed);
        assert_eq!(backups[2].pending_source, None);
    }

    #[test]
    fn write_too_large_message_names_both_sizes() {
        let err = LogKeeperError::WriteTooLarge { len: 17, max: 5 };
        assert_eq!(
            err.to_string(),
            "write length 17 exceeds maximum file size 5"
        );
    }

    #[test]
    fn default_filename_lands_in_temp_dir() {
        let filename = default_filename();
        assert!(filename.starts_with(env::temp_dir()));
        assert!(filename
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("-rolling.log"));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn config_decodes_from_json() {
        let config: Config = serde_json::from_str(
            r#"{
                "filename": "foo",
                "maxbytes": 5,
                "maxage": 10,
                "maxbackups": 3,
                "localtime": true,
                "compress": true
            }"#,
        )
        .unwrap();
        assert_eq!(config.filename, PathBuf::from("foo"));
        assert_eq!(config.max_bytes, 5);
        assert_eq!(config.max_age_days, 10);
        assert_eq!(config.max_backups, 3);
        assert!(config.local_time);
        assert!(config.compress);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn config_decodes_from_toml() {
        let config: Config = toml::from_str(
            r#"
            filename = "foo"
            maxbytes = 5
            maxage = 10
            maxbackups = 3
            localtime = true
            compress = true
            "#,
        )
        .unwrap();
        assert_eq!(config.filename, PathBuf::from("foo"));
        assert_eq!(config.max_bytes, 5);
        assert_eq!(config.max_age_days, 10);
        assert_eq!(config.max_backups, 3);
        assert!(config.local_time);
        assert!(config.compress);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn config_fields_all_default() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.filename, PathBuf::new());
        assert_eq!(config.max_bytes, 0);
        assert_eq!(config.max_age_days, 0);
        assert_eq!(config.max_backups, 0);
        assert!(!config.local_time);
        assert!(!config.compress);
    }
}
