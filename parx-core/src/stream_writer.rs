//! Stream writer (C6): placement and sequential per-stripe append of one
//! object's blocks across its placement archives.
//!
//! Placement draws a shuffled ordering of archive indices once per block,
//! and each stripe dequeues the next archive from that FIFO, retrying
//! with the following archive on failure. An archive is never re-enqueued
//! once dequeued, matching the reference `WriteBuff`'s single-dequeue,
//! no-replacement `servers` queue: an archive that already holds one
//! stripe of this block must never be handed a second one, or losing it
//! alone could destroy more than `nbparity` stripes. With exactly
//! `nbchunks` archives opened, that means a single append failure leaves
//! no spare archive to retry against and the block write fails outright
//! -- this is intentional, not a regression, and callers that want
//! retry headroom must open more placements than `nbchunks`. The shuffle
//! seed is not reproducible across runs; it is an internal detail, not
//! part of the observable contract.

use crate::archive::{ArchiveClient, OpenMode};
use crate::config::ObjectConfig;
use crate::error::{EcError, EcResult};
use crate::runtime::Runtime;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};

fn shuffled_indices(n: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..n).collect();
    let mut rng_state = {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9E3779B97F4A7C15)
    };
    // xorshift64*, adequate for a one-off placement shuffle with no
    // reproducibility requirement.
    let mut next = move || {
        rng_state ^= rng_state << 13;
        rng_state ^= rng_state >> 7;
        rng_state ^= rng_state << 17;
        rng_state
    };
    for i in (1..idx.len()).rev() {
        let j = (next() as usize) % (i + 1);
        idx.swap(i, j);
    }
    idx
}

pub struct StreamWriter {
    objcfg: ObjectConfig,
    runtime: Arc<Runtime>,
    archives: Arc<dyn ArchiveClient>,
    /// Per-block FIFO of archive indices still available to try, seeded
    /// fresh for each block.
    opened: Vec<bool>,
    blkid: usize,
    nbytes_written: u64,
}

impl StreamWriter {
    pub fn open(objcfg: ObjectConfig, runtime: Arc<Runtime>, archives: Arc<dyn ArchiveClient>) -> EcResult<Self> {
        let mut opened = vec![false; objcfg.nbchunks];
        let mut failures = 0usize;
        for i in 0..objcfg.nbchunks {
            match archives.open(&objcfg.data_url(i), OpenMode::Create) {
                Ok(()) => opened[i] = true,
                Err(_) => failures += 1,
            }
        }
        if objcfg.nbchunks - failures < objcfg.nbdata {
            return Err(EcError::data_error("not enough archives opened to write"));
        }
        Ok(StreamWriter {
            objcfg,
            runtime,
            archives,
            opened,
            blkid: 0,
            nbytes_written: 0,
        })
    }

    /// Writes one full block's stripes (data + parity, already encoded),
    /// placing each onto a shuffled FIFO of archive indices and retrying
    /// on append failure until enough succeed. `data_len` is the number of
    /// real (unpadded) data bytes this block carries, used to derive the
    /// object's logical `filesize` on close independent of tail padding.
    pub fn write_block(&mut self, stripes: &[Vec<u8>], data_len: u64) -> EcResult<()> {
        if stripes.len() != self.objcfg.nbchunks {
            return Err(EcError::InvalidArgs("stripe count mismatch".into()));
        }
        let order = shuffled_indices(self.objcfg.nbchunks);
        let mut fifo: VecDeque<usize> = order.into_iter().filter(|&i| self.opened[i]).collect();
        let mut successes = 0usize;

        for (strpid, data) in stripes.iter().enumerate() {
            let name = self.objcfg.stripe_file_name(self.blkid, strpid);
            let mut placed = false;
            while let Some(archive_idx) = fifo.pop_front() {
                let url = self.objcfg.data_url(archive_idx);
                let result = self
                    .runtime
                    .dispatch(|| self.archives.append_file(&url, &name, data));
                match result {
                    Ok(_) => {
                        placed = true;
                        successes += 1;
                        break;
                    }
                    Err(e) => {
                        warn!("stream_writer: append of {name} to archive {archive_idx} failed: {e}");
                        continue;
                    }
                }
            }
            if !placed {
                return Err(EcError::data_error(format!("could not place stripe {strpid}")));
            }
        }

        if successes < self.objcfg.nbdata + self.objcfg.nbparity {
            return Err(EcError::data_error("too few archives accepted this block"));
        }
        info!("stream_writer: block {} placed ({successes} stripes)", self.blkid);
        self.blkid += 1;
        self.nbytes_written += data_len;
        Ok(())
    }

    /// Finalizes the object: stamps `xrdec.filesize`/`xrdec.strpver` on every
    /// still-open data archive, closes them, and (unless `nomtfile`) writes
    /// the side-car metadata replicas before closing. Closing data archives
    /// succeeds once at least `nbchunks` of them closed cleanly; metadata
    /// replication succeeds once at least `nbparity + 1` replicas wrote.
    pub fn close(self) -> EcResult<u64> {
        let strpver = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            .to_string();

        let mut cd_blobs: Vec<(usize, Vec<u8>)> = Vec::new();
        if !self.objcfg.nomtfile {
            for (i, opened) in self.opened.iter().enumerate() {
                if *opened {
                    let url = self.objcfg.data_url(i);
                    if let Ok(raw) = self.archives.cd_raw(&url) {
                        cd_blobs.push((i, raw));
                    }
                }
            }
        }

        let mut closed = 0usize;
        for (i, opened) in self.opened.iter().enumerate() {
            if *opened {
                let url = self.objcfg.data_url(i);
                self.archives
                    .set_xattr(&url, "xrdec.filesize", &self.nbytes_written.to_string())?;
                self.archives.set_xattr(&url, "xrdec.strpver", &strpver)?;
                if self.archives.close(&url).is_ok() {
                    closed += 1;
                }
            }
        }
        if closed < self.objcfg.nbchunks {
            return Err(EcError::data_error("too few archives closed cleanly"));
        }

        if !self.objcfg.nomtfile && !cd_blobs.is_empty() {
            let mut replicas_ok = 0usize;
            for i in 0..self.objcfg.nbchunks.min(self.objcfg.plgr.len()) {
                let murl = self.objcfg.metadata_url(i);
                if self.archives.open(&murl, OpenMode::Create).is_err() {
                    continue;
                }
                let mut ok = true;
                for (idx, blob) in &cd_blobs {
                    if self
                        .archives
                        .append_file(&murl, &idx.to_string(), blob)
                        .is_err()
                    {
                        ok = false;
                        break;
                    }
                }
                if ok {
                    let _ = self
                        .archives
                        .set_xattr(&murl, "xrdec.filesize", &self.nbytes_written.to_string());
                    if self.archives.close(&murl).is_ok() {
                        replicas_ok += 1;
                        continue;
                    }
                } else {
                    let _ = self.archives.close(&murl);
                }
            }
            if replicas_ok < self.objcfg.nbparity + 1 {
                return Err(EcError::data_error("too few metadata replicas written"));
            }
        }

        Ok(self.nbytes_written)
    }
}

/// Chunks an arbitrary byte stream into `datasize`-sized blocks, encodes
/// parity for each via the object's redundancy provider, and places every
/// block through a fresh `StreamWriter`. Models the reference's public
/// `Write`/`Close` pair as one call: the object-level orchestration (C5+C6
/// together) a caller like `parx-cli` actually drives.
pub fn write_object<R: std::io::Read>(
    mut input: R,
    objcfg: &ObjectConfig,
    runtime: &Arc<Runtime>,
    archives: Arc<dyn ArchiveClient>,
) -> EcResult<u64> {
    let mut writer = StreamWriter::open(objcfg.clone(), runtime.clone(), archives)?;
    loop {
        let mut wb = runtime.write_buffer_pool().acquire_for(objcfg.nbdata);
        let mut block_bytes = 0usize;
        let mut read_buf = vec![0u8; objcfg.chunksize];
        while !wb.is_full() {
            let n = input.read(&mut read_buf).map_err(EcError::from)?;
            if n == 0 {
                break;
            }
            wb.write(&read_buf[..n])?;
            block_bytes += n;
        }
        if block_bytes == 0 {
            break;
        }
        // Real per-stripe payload lengths must be captured before `pad()`
        // commits the write cursor to the full (zero-padded) data region.
        let stripe_sizes: Vec<usize> = (0..objcfg.nbchunks).map(|i| wb.stripe_size(i)).collect();
        wb.pad();
        wb.encode(runtime.redundancy())?;
        let stripes: Vec<Vec<u8>> = (0..objcfg.nbchunks)
            .map(|i| wb.stripe(i)[..stripe_sizes[i]].to_vec())
            .collect();
        writer.write_block(&stripes, block_bytes as u64)?;
        if block_bytes < objcfg.datasize {
            break;
        }
    }
    writer.close()
}
