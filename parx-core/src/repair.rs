//! Repair tool (C8): validates and restores an object's archives.
//!
//! `check_file` walks every open archive's central directory, compares
//! each CDFH record against a recomputed read-back of its member data
//! (the portion of `CompareLFHToCDFH` meaningful across archive-client
//! backends that don't expose raw on-disk byte offsets), verifies
//! per-stripe CRC, and reads the `xrdec.corrupted` xattr. `repair_file`
//! shares that validation path and additionally allocates replacement
//! archives from `plgr_replace` (consumed in order, never re-redirecting
//! an already-redirected URL), marks originals `xrdec.corrupted=1`, and
//! rewrites every affected block's stripes onto the replacement archive
//! under the original stripe file name.
//!
//! Placement is shuffled per block by the writer, so the archive a given
//! member name actually lives on can't be derived from its position in
//! `objcfg.plgr`; every lookup here goes through a urlmap built from the
//! central directories of the archives still reachable at the time.

use crate::archive::{ArchiveClient, OpenMode};
use crate::config::{block_id_from_filename, stripe_id_from_filename, ObjectConfig};
use crate::error::{EcError, EcResult};
use crate::redundancy::{RedundancyProvider, StripeSlot};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ArchiveIssue {
    pub url: String,
    pub corrupted_xattr: bool,
    pub metadata_mismatches: Vec<String>,
    pub crc_failures: Vec<String>,
    /// Member file names this archive's own central directory listed at
    /// check time, kept so `repair_file` can rebuild each one without
    /// assuming a position-based mapping back to (block, stripe).
    pub members: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, Default)]
pub struct CheckReport {
    pub issues: Vec<ArchiveIssue>,
    /// `stripe_file_name -> archive_url`, built from the central
    /// directories of every archive that checked out clean (no corrupted
    /// xattr, no metadata mismatch on that member). Used by `repair_file`
    /// to locate the surviving siblings of a stripe being rebuilt, since
    /// placement is shuffled per block and not derivable from position.
    pub urlmap: HashMap<String, String>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.issues.iter().all(|i| {
            !i.corrupted_xattr && i.metadata_mismatches.is_empty() && i.crc_failures.is_empty()
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RepairReport {
    pub redirected: HashMap<String, String>,
    pub blocks_repaired: u64,
    pub blocks_failed: u64,
}

/// Compares a central-directory record against a read-back of its member
/// data: CRC32 and uncompressed size, catching archive-level metadata
/// corruption that trusting the CD blindly would miss.
fn compare_lfh_to_cdfh(
    archives: &dyn ArchiveClient,
    url: &str,
    file_name: &str,
) -> EcResult<Vec<String>> {
    let cd = archives.cd_entries(url)?;
    let cdfh = match cd.get(file_name) {
        Some(c) => c,
        None => return Ok(vec![format!("{file_name}: missing from central directory")]),
    };
    let mut mismatches = Vec::new();
    match archives.read_file(url, file_name) {
        Ok(data) => {
            let crc = crc32fast::hash(&data);
            if crc != cdfh.crc32 {
                mismatches.push(format!("{file_name}: crc32 mismatch in central directory"));
            }
            if data.len() as u32 != cdfh.uncompressed_size {
                mismatches.push(format!("{file_name}: size mismatch in central directory"));
            }
        }
        Err(e) => mismatches.push(format!("{file_name}: unreadable ({e})")),
    }
    Ok(mismatches)
}

fn archive_corrupted(archives: &dyn ArchiveClient, url: &str) -> bool {
    matches!(archives.get_xattr(url, "xrdec.corrupted"), Ok(Some(v)) if v != "0")
}

/// Validates every archive in `objcfg.plgr[0..nbchunks]` without altering
/// anything.
pub fn check_file(objcfg: &ObjectConfig, archives: &dyn ArchiveClient) -> EcResult<CheckReport> {
    let mut report = CheckReport::default();
    for i in 0..objcfg.nbchunks {
        let url = objcfg.data_url(i);
        if archives.open(&url, OpenMode::ReadOnly).is_err() {
            continue;
        }
        let corrupted_xattr = archive_corrupted(archives, &url);
        let mut metadata_mismatches = Vec::new();
        let mut crc_failures = Vec::new();

        let cd = archives.cd_entries(&url)?;
        let mut names: Vec<String> = cd.keys().cloned().collect();
        names.sort();
        for name in &names {
            let mut member_ok = true;
            match compare_lfh_to_cdfh(archives, &url, name) {
                Ok(m) => {
                    for msg in m {
                        member_ok = false;
                        if msg.contains("crc32") || msg.contains("unreadable") {
                            crc_failures.push(msg);
                        } else {
                            metadata_mismatches.push(msg);
                        }
                    }
                }
                Err(e) => {
                    member_ok = false;
                    crc_failures.push(format!("{name}: {e}"));
                }
            }
            if member_ok && !corrupted_xattr {
                report.urlmap.entry(name.clone()).or_insert_with(|| url.clone());
            }
        }

        report.issues.push(ArchiveIssue {
            url: url.clone(),
            corrupted_xattr,
            metadata_mismatches,
            crc_failures,
            members: names,
        });
        let _ = archives.close(&url);
    }
    Ok(report)
}

/// Payload size a given stripe of a given block should carry, following
/// the write-size rule: data stripe `s < nbdata` gets
/// `max(0, filesize - (blkid*datasize + s*chunksize))` capped at
/// `chunksize`; every parity stripe (`s >= nbdata`) mirrors data stripe
/// 0's payload size for the same block. Zero-byte stripes are still
/// written (a block entirely past `filesize` writes empty members).
pub fn stripe_write_size(objcfg: &ObjectConfig, filesize: u64, blkid: usize, strpid: usize) -> usize {
    let block_data_start = (blkid * objcfg.datasize) as u64;
    if strpid < objcfg.nbdata {
        let stripe_start = block_data_start + (strpid * objcfg.chunksize) as u64;
        if stripe_start >= filesize {
            0
        } else {
            ((filesize - stripe_start) as usize).min(objcfg.chunksize)
        }
    } else {
        stripe_write_size(objcfg, filesize, blkid, 0)
    }
}

/// Allocates replacement archive URLs for corrupted placements,
/// consuming `plgr_replace` in order and never re-redirecting a URL that
/// already has a replacement in this session.
pub struct RedirectionMap {
    next_replacement: usize,
    redirected: HashMap<String, String>,
}

impl Default for RedirectionMap {
    fn default() -> Self {
        Self::new()
    }
}

impl RedirectionMap {
    pub fn new() -> Self {
        RedirectionMap {
            next_replacement: 0,
            redirected: HashMap::new(),
        }
    }

    pub fn redirect(&mut self, objcfg: &ObjectConfig, original_url: &str) -> EcResult<String> {
        if let Some(existing) = self.redirected.get(original_url) {
            return Ok(existing.clone());
        }
        if self.next_replacement >= objcfg.plgr_replace.len() {
            return Err(EcError::NoMoreReplicas);
        }
        let replacement = objcfg.replacement_url(self.next_replacement);
        self.next_replacement += 1;
        self.redirected
            .insert(original_url.to_string(), replacement.clone());
        Ok(replacement)
    }
}

/// Reconstructs one stripe's bytes (for the archive being redirected) by
/// reading every other surviving stripe of the block -- located through
/// `urlmap`, not by assuming archive position equals stripe id -- and
/// running the redundancy provider's `compute`.
fn recover_stripe_bytes(
    objcfg: &ObjectConfig,
    archives: &Arc<dyn ArchiveClient>,
    urlmap: &HashMap<String, String>,
    redundancy: &RedundancyProvider,
    blkid: usize,
    target_strpid: usize,
    want: usize,
) -> EcResult<Vec<u8>> {
    let mut buffers = vec![vec![0u8; objcfg.chunksize]; objcfg.nbchunks];
    let mut valid = vec![false; objcfg.nbchunks];

    for strpid in 0..objcfg.nbchunks {
        if strpid == target_strpid {
            continue;
        }
        let name = objcfg.stripe_file_name(blkid, strpid);
        let Some(url) = urlmap.get(&name) else {
            continue;
        };
        if archives.open(url, OpenMode::ReadOnly).is_err() {
            continue;
        }
        if let Ok(mut data) = archives.read_file(url, &name) {
            data.resize(objcfg.chunksize, 0);
            buffers[strpid] = data;
            valid[strpid] = true;
        }
        let _ = archives.close(url);
    }

    let mut slots: Vec<StripeSlot> = buffers
        .iter_mut()
        .zip(valid.iter())
        .map(|(b, &v)| StripeSlot { buffer: b, valid: v })
        .collect();
    redundancy.compute(&mut slots)?;
    let mut result = buffers[target_strpid].clone();
    result.truncate(want);
    Ok(result)
}

/// Validates and, where possible, repairs every archive of the object.
/// Archives that fail validation are marked `xrdec.corrupted=1` and
/// closed; their member stripes are rewritten onto a replacement archive
/// allocated from `plgr_replace`.
pub fn repair_file(
    objcfg: &ObjectConfig,
    archives: Arc<dyn ArchiveClient>,
    redundancy: &RedundancyProvider,
) -> EcResult<RepairReport> {
    let check = check_file(objcfg, &*archives)?;
    let mut redirection = RedirectionMap::new();
    let mut blocks_repaired = 0u64;
    let mut blocks_failed = 0u64;

    let filesize = (0..objcfg.nbchunks)
        .find_map(|i| {
            let url = objcfg.data_url(i);
            archives.open(&url, OpenMode::ReadOnly).ok()?;
            let v = archives.get_xattr(&url, "xrdec.filesize").ok().flatten();
            let _ = archives.close(&url);
            v.and_then(|s| s.parse::<u64>().ok())
        })
        .ok_or_else(|| EcError::data_error("no archive carried a readable filesize xattr"))?;

    for issue in &check.issues {
        let needs_redirect = issue.corrupted_xattr || !issue.metadata_mismatches.is_empty();
        if !needs_redirect {
            continue;
        }

        let replacement_url = redirection.redirect(objcfg, &issue.url)?;
        archives.open(&issue.url, OpenMode::Update)?;
        archives.set_xattr(&issue.url, "xrdec.corrupted", "1")?;
        archives.close(&issue.url)?;

        archives.open(&replacement_url, OpenMode::Create)?;
        for member in &issue.members {
            let (blkid, strpid) = match (
                block_id_from_filename(member),
                stripe_id_from_filename(member),
            ) {
                (Some(b), Some(s)) => (b, s),
                _ => {
                    blocks_failed += 1;
                    continue;
                }
            };
            let want = stripe_write_size(objcfg, filesize, blkid, strpid);
            match recover_stripe_bytes(objcfg, &archives, &check.urlmap, redundancy, blkid, strpid, want) {
                Ok(bytes) => {
                    archives.append_file(&replacement_url, member, &bytes)?;
                    blocks_repaired += 1;
                }
                Err(_) => blocks_failed += 1,
            }
        }
        archives.set_xattr(&replacement_url, "xrdec.filesize", &filesize.to_string())?;
        archives.close(&replacement_url)?;
    }

    Ok(RepairReport {
        redirected: redirection.redirected,
        blocks_repaired,
        blocks_failed,
    })
}
