//! Archive client (C6/C7 collaborator): the abstract boundary for reading
//! and writing the per-placement archive files, plus a filesystem-backed
//! implementation used for tests and as the crate's reference collaborator.
//!
//! Grounded on the reference `XrdEc` archive-client contract together with
//! the ZIP container layout in `zip.rs`. The original's asynchronous,
//! callback-completed primitives are realized here as plain blocking calls;
//! callers that want concurrency dispatch them onto `Runtime`'s worker pool
//! (see `runtime.rs`) rather than this trait taking callbacks itself.

use crate::error::{EcError, EcResult};
use crate::zip::{Cdfh, Eocd, Lfh};
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const DEFAULT_MODE: u32 = 0o644;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Whether an archive is being opened for reading, writing (append), or
/// update (overwrite-in-place, used by the repair tool).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    Create,
    Update,
}

/// One requested byte range within an open archive, identified by member
/// file name, used by `vector_read`.
#[derive(Clone, Debug)]
pub struct ChunkRequest {
    pub file_name: String,
    pub offset: u64,
    pub length: usize,
}

/// Result of one `ChunkRequest`: either the bytes, or an error specific to
/// that sub-range (a missing member, a short read, a CRC mismatch). Its
/// own success/failure must be consulted independently of the enclosing
/// `vector_read` call's overall result.
pub struct ChunkResult {
    pub file_name: String,
    pub data: EcResult<Vec<u8>>,
}

/// Central-directory records keyed by member file name, handed back to
/// callers that need to compare against the raw on-disk headers (the
/// repair tool's metadata validation).
pub type CdIndex = HashMap<String, Cdfh>;

/// The abstract collaborator boundary used by the writer, reader and
/// repair tool. A networked object-store backend can implement this trait
/// without any of C3–C8 changing.
pub trait ArchiveClient: Send + Sync {
    fn open(&self, url: &str, mode: OpenMode) -> EcResult<()>;
    fn close(&self, url: &str) -> EcResult<()>;
    fn is_open(&self, url: &str) -> bool;

    /// Total size of the underlying archive file on disk (covers LFH + data
    /// + CD + EOCD), used for allocation/telemetry, not for stripe sizing.
    fn arch_size(&self, url: &str) -> EcResult<u64>;

    /// Appends a new member file (LFH + data + CD entry), returning the
    /// byte offset of its LFH.
    fn append_file(&self, url: &str, file_name: &str, data: &[u8]) -> EcResult<u64>;

    /// Overwrites an existing member's data in place if it fits in the
    /// same footprint, otherwise falls back to appending. Used by repair.
    fn write_into_file(&self, url: &str, file_name: &str, data: &[u8]) -> EcResult<u64>;

    /// Reads the full data of one member file, verified against its CD
    /// CRC32.
    fn read_file(&self, url: &str, file_name: &str) -> EcResult<Vec<u8>>;

    /// Batched read of byte ranges. The returned vector preserves request
    /// order; a `ChunkResult::data` error is local to that sub-request and
    /// does not abort the batch.
    fn vector_read(&self, url: &str, requests: &[ChunkRequest]) -> EcResult<Vec<ChunkResult>>;

    fn get_xattr(&self, url: &str, name: &str) -> EcResult<Option<String>>;
    fn set_xattr(&self, url: &str, name: &str, value: &str) -> EcResult<()>;

    /// CD entries of the currently-open archive, keyed by member file name.
    fn cd_entries(&self, url: &str) -> EcResult<CdIndex>;

    /// Verbatim serialized bytes of the currently-open archive's central
    /// directory (concatenated CDFH records, in record order). Used to
    /// build the side-car metadata archive: each metadata replica stores
    /// one member per data archive, whose payload is exactly this blob.
    fn cd_raw(&self, url: &str) -> EcResult<Vec<u8>>;
}

struct OpenArchive {
    mode: OpenMode,
    path: PathBuf,
    /// In-memory copy of the member records (LFH+data), populated from disk
    /// on open and flushed back on close (for `Create`/`Update` modes).
    records: Vec<(Lfh, Vec<u8>)>,
    xattrs: HashMap<String, String>,
    /// Held for the lifetime of a `Create`/`Update` open to keep concurrent
    /// writers (including other processes) from racing the flush-on-close.
    /// Released automatically when dropped at `close`.
    _lock: Option<File>,
}

fn lock_path(path: &std::path::Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".lock");
    PathBuf::from(p)
}

/// Filesystem-backed `ArchiveClient`: one ZIP-shaped file per placement
/// URL under `root`, with extended attributes persisted to a sidecar
/// `<file>.xattr` JSON document (portable across filesystems that don't
/// support user xattrs).
pub struct LocalArchiveClient {
    root: PathBuf,
    open: Mutex<HashMap<String, OpenArchive>>,
}

impl LocalArchiveClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalArchiveClient {
            root: root.into(),
            open: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, url: &str) -> PathBuf {
        let clean = url.split('?').next().unwrap_or(url);
        let sanitized = clean.replace(['/', '\\'], "_");
        self.root.join(sanitized)
    }

    fn xattr_path(path: &std::path::Path) -> PathBuf {
        let mut p = path.as_os_str().to_owned();
        p.push(".xattr");
        PathBuf::from(p)
    }

    fn load_xattrs(path: &std::path::Path) -> HashMap<String, String> {
        let xpath = Self::xattr_path(path);
        match fs::read_to_string(&xpath) {
            Ok(s) => serde_json::from_str(&s).unwrap_or_default(),
            Err(_) => HashMap::new(),
        }
    }

    fn save_xattrs(path: &std::path::Path, xattrs: &HashMap<String, String>) -> EcResult<()> {
        let xpath = Self::xattr_path(path);
        let s = serde_json::to_string(xattrs).map_err(|e| EcError::Unknown(e.to_string()))?;
        fs::write(xpath, s)?;
        Ok(())
    }

    fn read_existing(path: &std::path::Path) -> EcResult<Vec<(Lfh, Vec<u8>)>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(path)?;
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        let eocd = Eocd::find_and_parse(&bytes)?;
        let cd_start = eocd.cd_offset as usize;
        let cd_end = cd_start + eocd.cd_size as usize;
        let (cdvec, _) = crate::zip::parse_central_directory(&bytes[cd_start..cd_end])?;
        let mut records = Vec::with_capacity(cdvec.len());
        for cdfh in &cdvec {
            let lfh_off = cdfh.offset as usize;
            let (lfh, lfh_size) = Lfh::parse(&bytes[lfh_off..])?;
            let data_off = lfh_off + lfh_size;
            let data = bytes[data_off..data_off + cdfh.compressed_size as usize].to_vec();
            records.push((lfh, data));
        }
        Ok(records)
    }

    fn flush(path: &std::path::Path, records: &[(Lfh, Vec<u8>)]) -> EcResult<()> {
        let mut out = Vec::new();
        let mut cdvec = Vec::with_capacity(records.len());
        for (lfh, data) in records {
            let lfh_offset = out.len() as u64;
            lfh.serialize(&mut out);
            out.extend_from_slice(data);
            cdvec.push(Cdfh::from_lfh(lfh, DEFAULT_MODE, lfh_offset));
        }
        let cd_offset = out.len() as u64;
        for cdfh in &cdvec {
            cdfh.serialize(&mut out);
        }
        let cd_size = out.len() as u64 - cd_offset;
        let eocd = Eocd::new(cd_offset, cdvec.len() as u32, cd_size as u32);
        eocd.serialize(&mut out);
        fs::write(path, &out)?;
        Ok(())
    }

    fn cd_index_from(records: &[(Lfh, Vec<u8>)]) -> CdIndex {
        let mut map = CdIndex::new();
        let mut offset = 0u64;
        for (lfh, data) in records {
            map.insert(lfh.filename.clone(), Cdfh::from_lfh(lfh, DEFAULT_MODE, offset));
            offset += lfh.lfh_size as u64 + data.len() as u64;
        }
        map
    }
}

impl ArchiveClient for LocalArchiveClient {
    fn open(&self, url: &str, mode: OpenMode) -> EcResult<()> {
        let path = self.path_for(url);
        let mut guard = self.open.lock().unwrap();
        if guard.contains_key(url) {
            return Err(EcError::InvalidOp(format!("{url} already open")));
        }
        if mode == OpenMode::ReadOnly && !path.exists() {
            debug!("archive: {url} not found");
            return Err(EcError::NotFound(url.to_string()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let records = Self::read_existing(&path)?;
        let xattrs = Self::load_xattrs(&path);
        let lock = if mode == OpenMode::ReadOnly {
            None
        } else {
            let lf = File::create(lock_path(&path))?;
            lf.try_lock_exclusive()
                .map_err(|_| EcError::InvalidOp(format!("{url} is locked by another writer")))?;
            Some(lf)
        };
        guard.insert(
            url.to_string(),
            OpenArchive {
                mode,
                path,
                records,
                xattrs,
                _lock: lock,
            },
        );
        Ok(())
    }

    fn close(&self, url: &str) -> EcResult<()> {
        let mut guard = self.open.lock().unwrap();
        let arch = guard
            .remove(url)
            .ok_or_else(|| EcError::InvalidOp(format!("{url} not open")))?;
        if arch.mode != OpenMode::ReadOnly {
            Self::flush(&arch.path, &arch.records)?;
            debug!("archive: flushed {url} ({} members)", arch.records.len());
        }
        Self::save_xattrs(&arch.path, &arch.xattrs)?;
        Ok(())
    }

    fn is_open(&self, url: &str) -> bool {
        self.open.lock().unwrap().contains_key(url)
    }

    fn arch_size(&self, url: &str) -> EcResult<u64> {
        let guard = self.open.lock().unwrap();
        let arch = guard
            .get(url)
            .ok_or_else(|| EcError::InvalidOp(format!("{url} not open")))?;
        Ok(fs::metadata(&arch.path).map(|m| m.len()).unwrap_or(0))
    }

    fn append_file(&self, url: &str, file_name: &str, data: &[u8]) -> EcResult<u64> {
        let mut guard = self.open.lock().unwrap();
        let arch = guard
            .get_mut(url)
            .ok_or_else(|| EcError::InvalidOp(format!("{url} not open")))?;
        if arch.mode == OpenMode::ReadOnly {
            return Err(EcError::InvalidOp("archive is read-only".into()));
        }
        let offset = arch
            .records
            .iter()
            .fold(0u64, |acc, (l, d)| acc + l.lfh_size as u64 + d.len() as u64);
        let crc = crc32fast::hash(data);
        let lfh = Lfh::new(file_name, crc, data.len() as u32, now_unix());
        arch.records.push((lfh, data.to_vec()));
        Ok(offset)
    }

    fn write_into_file(&self, url: &str, file_name: &str, data: &[u8]) -> EcResult<u64> {
        {
            let mut guard = self.open.lock().unwrap();
            let arch = guard
                .get_mut(url)
                .ok_or_else(|| EcError::InvalidOp(format!("{url} not open")))?;
            if arch.mode != OpenMode::Update {
                return Err(EcError::InvalidOp("archive not open for update".into()));
            }
            let mut offset = 0u64;
            for (lfh, existing) in arch.records.iter_mut() {
                if lfh.filename == file_name {
                    if data.len() == existing.len() {
                        let crc = crc32fast::hash(data);
                        *lfh = Lfh::new(file_name, crc, data.len() as u32, now_unix());
                        *existing = data.to_vec();
                        return Ok(offset);
                    }
                    break;
                }
                offset += lfh.lfh_size as u64 + existing.len() as u64;
            }
        }
        self.append_file(url, file_name, data)
    }

    fn read_file(&self, url: &str, file_name: &str) -> EcResult<Vec<u8>> {
        let guard = self.open.lock().unwrap();
        let arch = guard
            .get(url)
            .ok_or_else(|| EcError::InvalidOp(format!("{url} not open")))?;
        let (lfh, data) = arch
            .records
            .iter()
            .find(|(l, _)| l.filename == file_name)
            .ok_or_else(|| EcError::NotFound(file_name.to_string()))?;
        let crc = crc32fast::hash(data);
        if crc != lfh.crc32 {
            warn!("archive: crc mismatch reading {file_name} from {url}");
            return Err(EcError::data_error(format!("crc mismatch in {file_name}")));
        }
        Ok(data.clone())
    }

    fn vector_read(&self, url: &str, requests: &[ChunkRequest]) -> EcResult<Vec<ChunkResult>> {
        if requests.len() > 1024 {
            return Err(EcError::InvalidArgs("vector read exceeds 1024 ranges".into()));
        }
        let guard = self.open.lock().unwrap();
        let arch = guard
            .get(url)
            .ok_or_else(|| EcError::InvalidOp(format!("{url} not open")))?;
        let mut results = Vec::with_capacity(requests.len());
        for req in requests {
            let data = arch
                .records
                .iter()
                .find(|(l, _)| l.filename == req.file_name)
                .ok_or_else(|| EcError::NotFound(req.file_name.clone()))
                .and_then(|(lfh, data)| {
                    let crc = crc32fast::hash(data);
                    if crc != lfh.crc32 {
                        return Err(EcError::data_error(format!(
                            "crc mismatch in {}",
                            req.file_name
                        )));
                    }
                    let start = req.offset as usize;
                    if start > data.len() {
                        return Err(EcError::InvalidArgs("offset past end of member".into()));
                    }
                    let end = (start + req.length).min(data.len());
                    Ok(data[start..end].to_vec())
                });
            results.push(ChunkResult {
                file_name: req.file_name.clone(),
                data,
            });
        }
        Ok(results)
    }

    fn get_xattr(&self, url: &str, name: &str) -> EcResult<Option<String>> {
        let guard = self.open.lock().unwrap();
        let arch = guard
            .get(url)
            .ok_or_else(|| EcError::InvalidOp(format!("{url} not open")))?;
        Ok(arch.xattrs.get(name).cloned())
    }

    fn set_xattr(&self, url: &str, name: &str, value: &str) -> EcResult<()> {
        let mut guard = self.open.lock().unwrap();
        let arch = guard
            .get_mut(url)
            .ok_or_else(|| EcError::InvalidOp(format!("{url} not open")))?;
        arch.xattrs.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn cd_entries(&self, url: &str) -> EcResult<CdIndex> {
        let guard = self.open.lock().unwrap();
        let arch = guard
            .get(url)
            .ok_or_else(|| EcError::InvalidOp(format!("{url} not open")))?;
        Ok(Self::cd_index_from(&arch.records))
    }

    fn cd_raw(&self, url: &str) -> EcResult<Vec<u8>> {
        let guard = self.open.lock().unwrap();
        let arch = guard
            .get(url)
            .ok_or_else(|| EcError::InvalidOp(format!("{url} not open")))?;
        let mut out = Vec::new();
        let mut offset = 0u64;
        for (lfh, data) in &arch.records {
            Cdfh::from_lfh(lfh, DEFAULT_MODE, offset).serialize(&mut out);
            offset += lfh.lfh_size as u64 + data.len() as u64;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let client = LocalArchiveClient::new(dir.path());
        client.open("primary", OpenMode::Create).unwrap();
        client.append_file("primary", "obj.0.0", b"hello").unwrap();
        client.append_file("primary", "obj.0.1", b"world!").unwrap();
        client.close("primary").unwrap();

        client.open("primary", OpenMode::ReadOnly).unwrap();
        assert_eq!(client.read_file("primary", "obj.0.0").unwrap(), b"hello");
        assert_eq!(client.read_file("primary", "obj.0.1").unwrap(), b"world!");
        client.close("primary").unwrap();
    }

    #[test]
    fn vector_read_batches_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let client = LocalArchiveClient::new(dir.path());
        client.open("primary", OpenMode::Create).unwrap();
        client.append_file("primary", "obj.0.0", b"0123456789").unwrap();
        client.close("primary").unwrap();

        client.open("primary", OpenMode::ReadOnly).unwrap();
        let reqs = vec![
            ChunkRequest { file_name: "obj.0.0".into(), offset: 0, length: 4 },
            ChunkRequest { file_name: "obj.0.0".into(), offset: 4, length: 4 },
        ];
        let results = client.vector_read("primary", &reqs).unwrap();
        assert_eq!(results[0].data.as_ref().unwrap(), b"0123");
        assert_eq!(results[1].data.as_ref().unwrap(), b"4567");
        client.close("primary").unwrap();
    }

    #[test]
    fn xattrs_persist_across_close() {
        let dir = tempfile::tempdir().unwrap();
        let client = LocalArchiveClient::new(dir.path());
        client.open("primary", OpenMode::Create).unwrap();
        client.set_xattr("primary", "xrdec.filesize", "1024").unwrap();
        client.close("primary").unwrap();

        client.open("primary", OpenMode::ReadOnly).unwrap();
        assert_eq!(
            client.get_xattr("primary", "xrdec.filesize").unwrap(),
            Some("1024".to_string())
        );
        client.close("primary").unwrap();
    }

    #[test]
    fn cd_raw_round_trips_through_parse_central_directory() {
        let dir = tempfile::tempdir().unwrap();
        let client = LocalArchiveClient::new(dir.path());
        client.open("primary", OpenMode::Create).unwrap();
        client.append_file("primary", "obj.0.0", b"hello").unwrap();
        client.append_file("primary", "obj.0.1", b"world!").unwrap();
        let raw = client.cd_raw("primary").unwrap();
        let (cdvec, _) = crate::zip::parse_central_directory(&raw).unwrap();
        let names: Vec<&str> = cdvec.iter().map(|c| c.filename.as_str()).collect();
        assert_eq!(names, vec!["obj.0.0", "obj.0.1"]);
        client.close("primary").unwrap();
    }

    #[test]
    fn update_overwrites_same_size_member() {
        let dir = tempfile::tempdir().unwrap();
        let client = LocalArchiveClient::new(dir.path());
        client.open("primary", OpenMode::Create).unwrap();
        client.append_file("primary", "obj.0.0", b"AAAA").unwrap();
        client.close("primary").unwrap();

        client.open("primary", OpenMode::Update).unwrap();
        client.write_into_file("primary", "obj.0.0", b"BBBB").unwrap();
        client.close("primary").unwrap();

        client.open("primary", OpenMode::ReadOnly).unwrap();
        assert_eq!(client.read_file("primary", "obj.0.0").unwrap(), b"BBBB");
        client.close("primary").unwrap();
    }
}
