//! Block / stripe cache (C3): per-stripe state machine with coalesced
//! reads and redundancy-backed recovery.
//!
//! States: `Empty -> Loading -> Valid`, `Loading -> Missing` (the backing
//! archive failed), `Missing -> Recovering -> Valid` or back to `Missing`
//! on a failed reconstruction. Concurrent reads of the same stripe while
//! it is `Loading` or `Recovering` are coalesced onto one FIFO queue of
//! pending callbacks rather than triggering redundant fetches, matching
//! the reference block cache's single-flight behaviour.

use crate::config::ObjectConfig;
use crate::error::{EcError, EcResult};
use crate::redundancy::{RedundancyProvider, StripeSlot};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StripeState {
    Empty,
    Loading,
    Valid,
    Missing,
    Recovering,
}

struct StripeEntry {
    state: StripeState,
    data: Vec<u8>,
    pending: Vec<Box<dyn FnOnce(EcResult<Vec<u8>>) + Send>>,
}

impl StripeEntry {
    fn new(chunksize: usize) -> Self {
        StripeEntry {
            state: StripeState::Empty,
            data: vec![0u8; chunksize],
            pending: Vec::new(),
        }
    }
}

/// One block's worth of cached stripes (`nbchunks` of them), shared by
/// every reader of that block.
pub struct Block {
    blkid: usize,
    objcfg: ObjectConfig,
    redundancy: Arc<RedundancyProvider>,
    stripes: Mutex<Vec<StripeEntry>>,
}

impl Block {
    pub fn new(blkid: usize, objcfg: ObjectConfig, redundancy: Arc<RedundancyProvider>) -> Self {
        let nbchunks = objcfg.nbchunks;
        let chunksize = objcfg.chunksize;
        Block {
            blkid,
            objcfg,
            redundancy,
            stripes: Mutex::new((0..nbchunks).map(|_| StripeEntry::new(chunksize)).collect()),
        }
    }

    pub fn blkid(&self) -> usize {
        self.blkid
    }

    pub fn state(&self, strpid: usize) -> StripeState {
        self.stripes.lock().unwrap()[strpid].state
    }

    /// Called by the fetch path once an archive read completes (or
    /// fails). Delivers the result to every coalesced waiter.
    pub fn on_fetch_complete(&self, strpid: usize, result: EcResult<Vec<u8>>) {
        let mut stripes = self.stripes.lock().unwrap();
        let entry = &mut stripes[strpid];
        let pending = std::mem::take(&mut entry.pending);
        match &result {
            Ok(data) => {
                // On-disk members of a tail/partial block are written
                // trimmed to their real payload length (see
                // `write_buffer::stripe_size`); the redundancy provider's
                // `compute` always operates over full `chunksize` buffers,
                // so a short fetch is zero-extended back to `chunksize`
                // before it's cached, matching `repair::recover_stripe_bytes`.
                let mut data = data.clone();
                data.resize(self.objcfg.chunksize, 0);
                entry.data = data;
                entry.state = StripeState::Valid;
            }
            Err(_) => {
                entry.state = StripeState::Missing;
            }
        }
        drop(stripes);
        for cb in pending {
            cb(result.clone_result());
        }
    }

    /// Reads stripe `strpid`. If already `Valid`, calls back immediately.
    /// If `Empty`, transitions to `Loading` and returns `true` so the
    /// caller knows it owns the fetch (and must eventually call
    /// `on_fetch_complete`); otherwise the callback is queued and `false`
    /// is returned.
    pub fn read(
        &self,
        strpid: usize,
        callback: Box<dyn FnOnce(EcResult<Vec<u8>>) + Send>,
    ) -> bool {
        let mut stripes = self.stripes.lock().unwrap();
        let entry = &mut stripes[strpid];
        match entry.state {
            StripeState::Valid => {
                let data = entry.data.clone();
                drop(stripes);
                callback(Ok(data));
                false
            }
            StripeState::Empty => {
                entry.state = StripeState::Loading;
                entry.pending.push(callback);
                true
            }
            StripeState::Loading | StripeState::Recovering | StripeState::Missing => {
                entry.pending.push(callback);
                false
            }
        }
    }

    /// Attempts to reconstruct every `Missing` stripe using whatever
    /// stripes are currently `Valid`. Fails if more stripes are missing
    /// than `nbparity` can repair.
    pub fn error_correction(&self) -> EcResult<()> {
        let mut stripes = self.stripes.lock().unwrap();
        let missing: Vec<usize> = stripes
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state == StripeState::Missing)
            .map(|(i, _)| i)
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        for &i in &missing {
            stripes[i].state = StripeState::Recovering;
        }

        let mut buffers: Vec<Vec<u8>> = stripes.iter().map(|e| e.data.clone()).collect();
        let valid_mask: Vec<bool> = stripes.iter().map(|e| e.state == StripeState::Valid).collect();
        drop(stripes);

        let mut slots: Vec<StripeSlot> = buffers
            .iter_mut()
            .zip(valid_mask.iter())
            .map(|(b, &v)| StripeSlot { buffer: b, valid: v })
            .collect();
        let result = self.redundancy.compute(&mut slots);

        let mut stripes = self.stripes.lock().unwrap();
        match result {
            Ok(()) => {
                for &i in &missing {
                    stripes[i].data = buffers[i].clone();
                    stripes[i].state = StripeState::Valid;
                    let pending = std::mem::take(&mut stripes[i].pending);
                    let data = stripes[i].data.clone();
                    drop(stripes);
                    for cb in pending {
                        cb(Ok(data.clone()));
                    }
                    stripes = self.stripes.lock().unwrap();
                }
                Ok(())
            }
            Err(e) => {
                for &i in &missing {
                    stripes[i].state = StripeState::Missing;
                }
                Err(EcError::data_error(format!("recovery failed: {e}")))
            }
        }
    }

    pub fn nbchunks(&self) -> usize {
        self.objcfg.nbchunks
    }
}

/// `EcResult<Vec<u8>>` is not `Clone` (the `Vec<u8>` inside is, but errors
/// in `EcError` are not derived `Clone`); this helper lets multiple
/// coalesced waiters each get their own copy of a successful read while a
/// failed one is re-described per waiter without sharing ownership.
trait CloneResult {
    fn clone_result(&self) -> Self;
}

impl CloneResult for EcResult<Vec<u8>> {
    fn clone_result(&self) -> Self {
        match self {
            Ok(v) => Ok(v.clone()),
            Err(e) => Err(EcError::data_error(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn objcfg() -> ObjectConfig {
        ObjectConfig::new("obj", 2, 1, 4, vec!["a".into(), "b".into(), "c".into()])
    }

    #[test]
    fn first_reader_owns_fetch_others_coalesce() {
        let cfg = objcfg();
        let rp = Arc::new(RedundancyProvider::new(&cfg));
        let block = Block::new(0, cfg, rp);

        let (tx1, rx1) = mpsc::channel();
        let owns_fetch = block.read(0, Box::new(move |r| tx1.send(r).unwrap()));
        assert!(owns_fetch);

        let (tx2, rx2) = mpsc::channel();
        let owns_second = block.read(0, Box::new(move |r| tx2.send(r).unwrap()));
        assert!(!owns_second);

        block.on_fetch_complete(0, Ok(vec![1, 2, 3, 4]));
        assert_eq!(rx1.recv().unwrap().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(rx2.recv().unwrap().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(block.state(0), StripeState::Valid);
    }

    #[test]
    fn recovers_missing_stripe_from_valid_ones() {
        let cfg = objcfg();
        let rp = Arc::new(RedundancyProvider::new(&cfg));
        let block = Block::new(0, cfg.clone(), rp.clone());

        block.on_fetch_complete(0, Ok(vec![1, 2, 3, 4]));
        block.on_fetch_complete(1, Ok(vec![5, 6, 7, 8]));
        // Compute parity directly so recovery has something to check against.
        let mut d0 = vec![1u8, 2, 3, 4];
        let mut d1 = vec![5u8, 6, 7, 8];
        let mut p = vec![0u8; 4];
        {
            let mut slots = vec![
                StripeSlot { buffer: &mut d0, valid: true },
                StripeSlot { buffer: &mut d1, valid: true },
                StripeSlot { buffer: &mut p, valid: false },
            ];
            rp.compute(&mut slots).unwrap();
        }
        block.on_fetch_complete(2, Ok(p));
        block.on_fetch_complete(1, Err(EcError::data_error("gone")));

        block.error_correction().unwrap();
        assert_eq!(block.state(1), StripeState::Valid);
    }
}
