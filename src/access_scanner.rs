//! The access scanner: records which documents are resident so the next
//! warmup can load the hot set first.
//!
//! Writes one log per shard (`access.log.<shard>`), rotating the previous
//! log to `.old`. Only runs while the resident ratio is below the
//! configured threshold; a fully-resident bucket will be reloaded whole
//! at warmup anyway, so a pass is recorded as a skip.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::executor::{TaskOutcome, TaskRunner};
use crate::stats::EngineStats;
use crate::types::{DocKey, Vbid};
use crate::vbucket::VBucketMap;

const ACCESS_LOG_MAGIC: &[u8; 8] = b"emberalg";

/// Warmup-acceleration log writer.
pub struct AccessScanner {
    vbmap: Arc<VBucketMap>,
    config: Arc<Config>,
    stats: Arc<EngineStats>,
}

impl AccessScanner {
    /// Creates the scanner.
    pub fn new(
        vbmap: Arc<VBucketMap>,
        config: Arc<Config>,
        stats: Arc<EngineStats>,
    ) -> Arc<AccessScanner> {
        Arc::new(AccessScanner { vbmap, config, stats })
    }

    /// Wraps the scanner as an executor task.
    pub fn task(self: &Arc<AccessScanner>) -> Box<dyn TaskRunner> {
        Box::new(AccessScannerTask(Arc::clone(self)))
    }

    /// Path of the shard's access log.
    pub fn log_path(config: &Config, shard: usize) -> PathBuf {
        config.data_dir.join(format!("{}.{shard}", config.alog_path))
    }

    fn overall_resident_ratio(&self) -> u8 {
        let live = self.vbmap.iter_live();
        if live.is_empty() {
            return 100;
        }
        let sum: u64 = live.iter().map(|vb| vb.resident_ratio() as u64).sum();
        (sum / live.len() as u64) as u8
    }

    /// One pass: write a log per shard, or record a skip when residency
    /// is high enough that the log would not help.
    pub fn sweep(&self) -> Result<bool> {
        let ratio = self.overall_resident_ratio();
        if ratio >= self.config.alog_resident_ratio_threshold {
            self.stats.inc_access_scanner_skips();
            debug!(ratio, "accessscanner.skipped");
            return Ok(false);
        }
        for shard in 0..self.config.max_num_shards {
            let mut entries: Vec<(Vbid, DocKey)> = Vec::new();
            for vb in self.vbmap.iter_shard(shard, self.config.max_num_shards) {
                let vbid = vb.id();
                let keys = vb
                    .ht()
                    .keys_where(|sv| sv.is_resident() && !sv.is_deleted() && !sv.is_temp());
                entries.extend(keys.into_iter().map(|k| (vbid, k)));
            }
            let path = Self::log_path(&self.config, shard);
            write_access_log(&path, &entries)?;
            info!(shard, keys = entries.len(), file = %path.display(), "accessscanner.wrote");
        }
        self.stats.inc_access_scanner_runs();
        Ok(true)
    }
}

struct AccessScannerTask(Arc<AccessScanner>);

impl TaskRunner for AccessScannerTask {
    fn run(&self) -> TaskOutcome {
        if let Err(err) = self.0.sweep() {
            tracing::warn!(error = %err, "accessscanner.failed");
        }
        TaskOutcome::Snooze(self.0.config.alog_sleep_time)
    }

    fn description(&self) -> String {
        "scanning resident keys into the access log".to_string()
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Writes (rotating the previous log to `.old`) the given entries.
pub fn write_access_log(path: &Path, entries: &[(Vbid, DocKey)]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = with_suffix(path, ".tmp");
    {
        let file = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp)?;
        let mut out = BufWriter::new(file);
        out.write_all(ACCESS_LOG_MAGIC)?;
        for (vbid, key) in entries {
            let key_bytes = key.as_bytes();
            out.write_all(&vbid.0.to_le_bytes())?;
            out.write_all(&(key_bytes.len() as u16).to_le_bytes())?;
            out.write_all(key_bytes)?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
    }
    if path.exists() {
        let _ = fs::rename(path, with_suffix(path, ".old"));
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Path of the rotated previous log for `path`.
pub fn rotated_path(path: &Path) -> PathBuf {
    with_suffix(path, ".old")
}

/// Reads a prior access log; a missing file yields an empty list.
pub fn read_access_log(path: &Path) -> Result<Vec<(Vbid, DocKey)>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut reader = BufReader::new(file);
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != ACCESS_LOG_MAGIC {
        return Err(EngineError::corrupt("bad access log magic"));
    }
    let mut entries = Vec::new();
    loop {
        let mut head = [0u8; 4];
        match reader.read_exact(&mut head) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let vbid = u16::from_le_bytes([head[0], head[1]]);
        let key_len = u16::from_le_bytes([head[2], head[3]]) as usize;
        let mut key = vec![0u8; key_len];
        match reader.read_exact(&mut key) {
            Ok(()) => entries.push((Vbid(vbid), DocKey::from(key))),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn log_round_trips_and_rotates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("access.log.0");
        let first = vec![(Vbid(0), DocKey::from("alpha")), (Vbid(3), DocKey::from("beta"))];
        write_access_log(&path, &first).unwrap();
        assert_eq!(read_access_log(&path).unwrap(), first);

        let second = vec![(Vbid(1), DocKey::from("gamma"))];
        write_access_log(&path, &second).unwrap();
        assert_eq!(read_access_log(&path).unwrap(), second);
        assert_eq!(read_access_log(&rotated_path(&path)).unwrap(), first);
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = tempdir().unwrap();
        let entries = read_access_log(&dir.path().join("nope")).unwrap();
        assert!(entries.is_empty());
    }
}
