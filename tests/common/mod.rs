//! Shared helpers for the integration tests.
//!
//! Backup names derive from the wall clock, so every test pins time to a
//! fixed instant and advances it by hand through [`ManualClock`].
#![allow(dead_code)]

use {
    chrono::{DateTime, Duration, Local, TimeZone as _, Utc},
    logkeeper::Clock,
    std::{
        fs,
        io::Read as _,
        path::{Path, PathBuf},
        sync::{Arc, Mutex},
    },
};

/// The timestamp layout the sink embeds in backup names.
pub const BACKUP_TIME_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3f";

/// Test clock advanced by hand.
#[derive(Clone)]
pub struct ManualClock(Arc<Mutex<DateTime<Utc>>>);

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        ManualClock(Arc::new(Mutex::new(start)))
    }

    /// Jump two days ahead: far enough to age a backup past a one-day bound
    /// and to guarantee a fresh backup name.
    pub fn advance_two_days(&self) {
        let mut now = self.0.lock().unwrap();
        *now = *now + Duration::days(2);
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

/// Instant all tests start from.
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 1, 19, 55, 3).unwrap() + Duration::milliseconds(412)
}

pub fn log_file(dir: &Path) -> PathBuf {
    dir.join("foobar.log")
}

/// Backup name for the given instant, rendered in UTC the way the sink does.
pub fn backup_file(dir: &Path, at: DateTime<Utc>) -> PathBuf {
    dir.join(format!("foobar-{}.log", at.format(BACKUP_TIME_FORMAT)))
}

/// Backup name for the given instant, rendered in the local time zone.
pub fn backup_file_local(dir: &Path, at: DateTime<Utc>) -> PathBuf {
    dir.join(format!(
        "foobar-{}.log",
        at.with_timezone(&Local).format(BACKUP_TIME_FORMAT)
    ))
}

/// `path` with the gzip suffix appended.
pub fn gz_file(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".gz");
    PathBuf::from(name)
}

/// Assert that `path` exists and holds exactly `content`.
pub fn exists_with_content(path: &Path, content: &[u8]) {
    let data = fs::read(path).unwrap_or_else(|err| panic!("read {}: {err}", path.display()));
    assert_eq!(data, content, "unexpected content in {}", path.display());
}

/// Assert that the directory holds exactly `expected` entries.
pub fn file_count(dir: &Path, expected: usize) {
    let names: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert_eq!(names.len(), expected, "directory entries: {names:?}");
}

/// Decompress the gzip stream at `path`.
pub fn gunzip(path: &Path) -> Vec<u8> {
    let file = fs::File::open(path).unwrap_or_else(|err| panic!("open {}: {err}", path.display()));
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(file)
        .read_to_end(&mut out)
        .unwrap_or_else(|err| panic!("gunzip {}: {err}", path.display()));
    out
}
