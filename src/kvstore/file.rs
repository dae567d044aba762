//! Bundled file-backed [`KvStore`] implementation.
//!
//! One file per vbucket under the data directory: a JSON state-record
//! header line followed by length-prefixed, CRC-guarded binary item
//! records. Commits rewrite the snapshot to a temp file and rename it into
//! place, so a torn write can only ever affect a file tail that is
//! detected and dropped on load. Large values are held snappy-compressed
//! on disk; the item's own datatype bitmask round-trips untouched.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use super::{
    CompactionConfig, CompactionHooks, CompactionSummary, FetchCtx, FetchOutcome, KvStore,
    ScanContinue, VBucketStateRecord, ValueFilter,
};
use crate::error::{EngineError, Result};
use crate::item::{unix_now, Item, ItemMeta};
use crate::types::{Cas, Datatype, DocKey, Seqno, VBucketState, Vbid};

/// Values at or above this size are snappy-compressed on disk.
const COMPRESS_THRESHOLD: usize = 128;

#[derive(Default)]
struct Txn {
    sets: Vec<Item>,
    dels: Vec<Item>,
    record: Option<VBucketStateRecord>,
}

struct VbData {
    record: VBucketStateRecord,
    items: BTreeMap<DocKey, Item>,
    txn: Option<Txn>,
}

impl VbData {
    fn fresh() -> VbData {
        VbData {
            record: VBucketStateRecord::new(VBucketState::Active),
            items: BTreeMap::new(),
            txn: None,
        }
    }

    fn live_count(&self) -> u64 {
        self.items.values().filter(|i| !i.deleted).count() as u64
    }

    fn max_seqno(&self) -> Seqno {
        self.items.values().map(|i| i.by_seqno).max().unwrap_or(0)
    }
}

struct VbHandle {
    data: RwLock<VbData>,
}

/// Snapshot-file store; see the module docs for the on-disk layout.
pub struct FileKvStore {
    dir: PathBuf,
    vbs: RwLock<FxHashMap<Vbid, Arc<VbHandle>>>,
}

impl FileKvStore {
    /// Opens a store rooted at `dir`, creating the directory if needed.
    /// Vbucket files are loaded lazily on first touch.
    pub fn open(dir: impl Into<PathBuf>) -> Result<FileKvStore> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FileKvStore { dir, vbs: RwLock::new(FxHashMap::default()) })
    }

    fn file_path(&self, vb: Vbid) -> PathBuf {
        self.dir.join(format!("{}.kv", vb.0))
    }

    fn tmp_path(&self, vb: Vbid) -> PathBuf {
        self.dir.join(format!("{}.kv.tmp", vb.0))
    }

    fn handle(&self, vb: Vbid, create: bool) -> Result<Option<Arc<VbHandle>>> {
        if let Some(h) = self.vbs.read().get(&vb) {
            return Ok(Some(Arc::clone(h)));
        }
        let mut vbs = self.vbs.write();
        if let Some(h) = vbs.get(&vb) {
            return Ok(Some(Arc::clone(h)));
        }
        let path = self.file_path(vb);
        let data = if path.exists() {
            load_file(&path, vb)?
        } else if create {
            VbData::fresh()
        } else {
            return Ok(None);
        };
        let handle = Arc::new(VbHandle { data: RwLock::new(data) });
        vbs.insert(vb, Arc::clone(&handle));
        Ok(Some(handle))
    }

    fn require(&self, vb: Vbid) -> Result<Arc<VbHandle>> {
        self.handle(vb, false)?.ok_or(EngineError::NoVBucketFile(vb))
    }

    fn persist(&self, vb: Vbid, data: &VbData) -> Result<()> {
        let tmp = self.tmp_path(vb);
        {
            let file = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp)?;
            let mut out = BufWriter::new(file);
            serde_json::to_writer(&mut out, &data.record)?;
            out.write_all(b"\n")?;
            for item in data.items.values() {
                write_record(&mut out, item)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, self.file_path(vb))?;
        Ok(())
    }
}

impl KvStore for FileKvStore {
    fn get(&self, vb: Vbid, key: &DocKey) -> Result<Option<Item>> {
        match self.handle(vb, false)? {
            Some(h) => Ok(h.data.read().items.get(key).cloned()),
            None => Ok(None),
        }
    }

    fn get_multi(&self, vb: Vbid, fetches: &mut FxHashMap<DocKey, FetchCtx>) -> Result<()> {
        let handle = self.handle(vb, false)?;
        let data = handle.as_ref().map(|h| h.data.read());
        for (key, ctx) in fetches.iter_mut() {
            let found = data.as_ref().and_then(|d| d.items.get(key).cloned());
            ctx.outcome = Some(match found {
                Some(mut item) => {
                    if ctx.meta_only {
                        item.value = None;
                    }
                    FetchOutcome::Found(item)
                }
                None => FetchOutcome::NotFound,
            });
        }
        Ok(())
    }

    fn begin(&self, vb: Vbid) -> Result<()> {
        let handle = self
            .handle(vb, true)?
            .ok_or(EngineError::NoVBucketFile(vb))?;
        let mut data = handle.data.write();
        if data.txn.is_some() {
            return Err(EngineError::InvalidArgument(format!(
                "transaction already open on {vb}"
            )));
        }
        data.txn = Some(Txn::default());
        Ok(())
    }

    fn set(&self, item: &Item) -> Result<()> {
        let handle = self.require(item.vbid)?;
        let mut data = handle.data.write();
        match data.txn.as_mut() {
            Some(txn) => {
                txn.sets.push(item.clone());
                Ok(())
            }
            None => Err(EngineError::InvalidArgument("set outside a transaction".into())),
        }
    }

    fn del(&self, item: &Item) -> Result<()> {
        let handle = self.require(item.vbid)?;
        let mut data = handle.data.write();
        match data.txn.as_mut() {
            Some(txn) => {
                txn.dels.push(item.clone());
                Ok(())
            }
            None => Err(EngineError::InvalidArgument("del outside a transaction".into())),
        }
    }

    fn snapshot_vbucket(&self, vb: Vbid, record: &VBucketStateRecord) -> Result<()> {
        let handle = self
            .handle(vb, true)?
            .ok_or(EngineError::NoVBucketFile(vb))?;
        let mut data = handle.data.write();
        match data.txn.as_mut() {
            Some(txn) => {
                txn.record = Some(record.clone());
                Ok(())
            }
            None => {
                data.record = record.clone();
                self.persist(vb, &data)
            }
        }
    }

    fn commit(&self, vb: Vbid) -> Result<()> {
        let handle = self.require(vb)?;
        let mut data = handle.data.write();
        let txn = data
            .txn
            .take()
            .ok_or_else(|| EngineError::InvalidArgument("commit without transaction".into()))?;
        for item in txn.sets {
            data.items.insert(item.key.clone(), item);
        }
        for mut item in txn.dels {
            item.deleted = true;
            item.value = None;
            data.items.insert(item.key.clone(), item);
        }
        if let Some(record) = txn.record {
            data.record = record;
        }
        data.record.high_seqno = data.record.high_seqno.max(data.max_seqno());
        self.persist(vb, &data)?;
        debug!(vb = vb.0, high_seqno = data.record.high_seqno, "kvstore.commit");
        Ok(())
    }

    fn rollback(&self, vb: Vbid) -> Result<()> {
        let handle = self.require(vb)?;
        handle.data.write().txn = None;
        Ok(())
    }

    fn compact_db(
        &self,
        vb: Vbid,
        cfg: &CompactionConfig,
        hooks: &mut dyn CompactionHooks,
    ) -> Result<CompactionSummary> {
        let handle = self.require(vb)?;
        let mut data = handle.data.write();
        let now = unix_now();
        let high_seqno = data.max_seqno();
        let mut summary = CompactionSummary::default();
        let mut keep: BTreeMap<DocKey, Item> = BTreeMap::new();
        for (key, item) in std::mem::take(&mut data.items) {
            if item.deleted {
                let purgeable = (cfg.drop_deletes || item.by_seqno < cfg.purge_before_seqno)
                    && item.by_seqno != high_seqno;
                if purgeable {
                    summary.tombstones_purged += 1;
                    summary.purged_up_to = summary.purged_up_to.max(item.by_seqno);
                    continue;
                }
            } else if item.is_expired_at(now) {
                hooks.expired(item.clone());
            }
            hooks.bloom_key(&key, item.deleted);
            keep.insert(key, item);
        }
        data.items = keep;
        if summary.purged_up_to > data.record.purge_seqno {
            data.record.purge_seqno = summary.purged_up_to;
        }
        self.persist(vb, &data)?;
        info!(
            vb = vb.0,
            tombstones = summary.tombstones_purged,
            purged_up_to = summary.purged_up_to,
            "kvstore.compacted"
        );
        Ok(summary)
    }

    fn list_persisted_vbuckets(&self) -> Result<Vec<(Vbid, VBucketStateRecord)>> {
        let mut found = Vec::new();
        for dent in fs::read_dir(&self.dir)? {
            let dent = dent?;
            let path = dent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("kv") {
                continue;
            }
            let Some(vbid) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u16>().ok())
            else {
                continue;
            };
            match read_header(&path) {
                Ok(record) => found.push((Vbid(vbid), record)),
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "kvstore.header.unreadable");
                }
            }
        }
        found.sort_by_key(|(vb, _)| vb.0);
        Ok(found)
    }

    fn scan(
        &self,
        vb: Vbid,
        start_seqno: Seqno,
        end_seqno: Seqno,
        filter: ValueFilter,
        cb: &mut dyn FnMut(Item) -> ScanContinue,
    ) -> Result<()> {
        let Some(handle) = self.handle(vb, false)? else {
            return Ok(());
        };
        let mut batch: Vec<Item> = {
            let data = handle.data.read();
            data.items
                .values()
                .filter(|i| i.by_seqno >= start_seqno && i.by_seqno <= end_seqno)
                .cloned()
                .collect()
        };
        batch.sort_by_key(|i| i.by_seqno);
        for mut item in batch {
            if filter == ValueFilter::KeysOnly {
                item.value = None;
            }
            if cb(item) == ScanContinue::Stop {
                break;
            }
        }
        Ok(())
    }

    fn get_item_count(&self, vb: Vbid) -> Result<u64> {
        match self.handle(vb, false)? {
            Some(h) => Ok(h.data.read().live_count()),
            None => Ok(0),
        }
    }

    fn get_db_file_size(&self, vb: Vbid) -> Result<u64> {
        match fs::metadata(self.file_path(vb)) {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn get_db_data_size(&self, vb: Vbid) -> Result<u64> {
        match self.handle(vb, false)? {
            Some(h) => Ok(h
                .data
                .read()
                .items
                .values()
                .map(|i| (i.key.len() + i.value_len()) as u64)
                .sum()),
            None => Ok(0),
        }
    }

    fn delete_vbucket(&self, vb: Vbid) -> Result<()> {
        self.vbs.write().remove(&vb);
        match fs::remove_file(self.file_path(vb)) {
            Ok(()) => {
                info!(vb = vb.0, "kvstore.file.deleted");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn read_header(path: &Path) -> Result<VBucketStateRecord> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    Ok(serde_json::from_str(line.trim_end())?)
}

fn load_file(path: &Path, vb: Vbid) -> Result<VbData> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let record: VBucketStateRecord = serde_json::from_str(line.trim_end())?;
    let mut items = BTreeMap::new();
    loop {
        let mut frame = [0u8; 8];
        match reader.read_exact(&mut frame) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        let crc = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        let mut payload = vec![0u8; len];
        if let Err(err) = reader.read_exact(&mut payload) {
            if err.kind() == ErrorKind::UnexpectedEof {
                warn!(file = %path.display(), "kvstore.load.torn_tail");
                break;
            }
            return Err(err.into());
        }
        if crc32fast::hash(&payload) != crc {
            warn!(file = %path.display(), "kvstore.load.bad_crc");
            break;
        }
        let item = decode_item(&payload, vb)?;
        items.insert(item.key.clone(), item);
    }
    Ok(VbData { record, items, txn: None })
}

fn write_record(out: &mut impl Write, item: &Item) -> Result<()> {
    let payload = encode_item(item)?;
    out.write_all(&(payload.len() as u32).to_le_bytes())?;
    out.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    out.write_all(&payload)?;
    Ok(())
}

fn encode_item(item: &Item) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64 + item.value_len());
    let key = item.key.as_bytes();
    buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(&item.meta.cas.0.to_le_bytes());
    buf.extend_from_slice(&item.by_seqno.to_le_bytes());
    buf.extend_from_slice(&item.meta.rev_seqno.to_le_bytes());
    buf.extend_from_slice(&item.meta.flags.to_le_bytes());
    buf.extend_from_slice(&item.meta.exptime.to_le_bytes());
    buf.push(item.meta.datatype.0);
    buf.push(item.deleted as u8);
    let (compressed, value): (u8, Vec<u8>) = match &item.value {
        Some(v) if v.len() >= COMPRESS_THRESHOLD => {
            let packed = snap::raw::Encoder::new()
                .compress_vec(v)
                .map_err(|e| EngineError::Decompress(e.to_string()))?;
            if packed.len() < v.len() {
                (1, packed)
            } else {
                (0, v.to_vec())
            }
        }
        Some(v) => (0, v.to_vec()),
        None => (0, Vec::new()),
    };
    buf.push(compressed);
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(&value);
    Ok(buf)
}

fn decode_item(payload: &[u8], vb: Vbid) -> Result<Item> {
    let mut cur = Cursor { buf: payload, off: 0 };
    let key_len = cur.u16()? as usize;
    let key = DocKey::from(cur.take(key_len)?);
    let cas = Cas(cur.u64()?);
    let by_seqno = cur.u64()?;
    let rev_seqno = cur.u64()?;
    let flags = cur.u32()?;
    let exptime = cur.u32()?;
    let datatype = Datatype(cur.u8()?);
    let deleted = cur.u8()? != 0;
    let compressed = cur.u8()? != 0;
    let value_len = cur.u32()? as usize;
    let raw = cur.take(value_len)?;
    let value = if deleted && raw.is_empty() {
        None
    } else if compressed {
        let inflated = snap::raw::Decoder::new()
            .decompress_vec(raw)
            .map_err(|e| EngineError::Decompress(e.to_string()))?;
        Some(Bytes::from(inflated))
    } else {
        Some(Bytes::copy_from_slice(raw))
    };
    Ok(Item {
        vbid: vb,
        key,
        meta: ItemMeta { cas, rev_seqno, flags, exptime, datatype },
        by_seqno,
        deleted,
        value,
    })
}

struct Cursor<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.off + n > self.buf.len() {
            return Err(EngineError::corrupt("truncated item record"));
        }
        let s = &self.buf[self.off..self.off + n];
        self.off += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let s = self.take(2)?;
        Ok(u16::from_le_bytes([s[0], s[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let s = self.take(4)?;
        Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let s = self.take(8)?;
        Ok(u64::from_le_bytes([s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]]))
    }
}
