//! Process-wide execution context: the worker pool plus the write-buffer
//! pool built against a single object configuration.
//!
//! None of this is a lazily-initialized global: a caller builds one
//! `Runtime` up front (CLI `main`, or a library entry point) and threads it
//! through by `Arc`.

use crate::redundancy::RedundancyProvider;
use crate::write_buffer::WriteBufferPool;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct Options {
    /// Worker threads backing archive I/O dispatch.
    pub worker_threads: usize,
    /// Capacity of the write-buffer pool (C5).
    pub write_buffer_pool_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            worker_threads: 64,
            write_buffer_pool_capacity: 1024,
        }
    }
}

/// Owns the bounded worker pool archive I/O is dispatched onto, plus the
/// write-buffer pool built against a single `ObjectConfig`.
pub struct Runtime {
    pool: ThreadPool,
    write_buffer_pool: WriteBufferPool,
    redundancy: Arc<RedundancyProvider>,
}

impl Runtime {
    pub fn new(objcfg: &crate::config::ObjectConfig, opts: Options) -> Self {
        let pool = ThreadPoolBuilder::new()
            .num_threads(opts.worker_threads)
            .build()
            .expect("failed to build worker pool");
        let redundancy = Arc::new(RedundancyProvider::new(objcfg));
        let write_buffer_pool =
            WriteBufferPool::new(opts.write_buffer_pool_capacity, objcfg.nbchunks, objcfg.chunksize);
        Runtime {
            pool,
            write_buffer_pool,
            redundancy,
        }
    }

    /// Dispatches `f` onto the worker pool and blocks the caller until it
    /// completes, returning its result. Ordering guarantees at the stripe
    /// level are enforced by the caller (`Block`'s pending-read queue), not
    /// by this dispatcher.
    pub fn dispatch<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T + Send,
        T: Send,
    {
        self.pool.install(f)
    }

    pub fn write_buffer_pool(&self) -> &WriteBufferPool {
        &self.write_buffer_pool
    }

    pub fn redundancy(&self) -> &Arc<RedundancyProvider> {
        &self.redundancy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObjectConfig;

    #[test]
    fn dispatch_runs_on_pool() {
        let objcfg = ObjectConfig::new("obj", 2, 1, 8, vec!["a".into(), "b".into(), "c".into()]);
        let rt = Runtime::new(&objcfg, Options::default());
        let result = rt.dispatch(|| 2 + 2);
        assert_eq!(result, 4);
    }
}
