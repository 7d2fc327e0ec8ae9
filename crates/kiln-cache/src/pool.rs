use rayon::prelude::*;

/// Bounded worker pool for hashing and trimming.
#[derive(Debug)]
pub enum WorkerPool {
    Rayon(rayon::ThreadPool),
    /// No worker thread could be started; work runs on the caller's thread.
    Inline,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        let mut threads = threads.max(1);
        loop {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|idx| format!("kiln-hash-{idx}"))
                .build()
            {
                Ok(pool) => return WorkerPool::Rayon(pool),
                // Thread limits in constrained environments: retry smaller.
                Err(_) if threads > 1 => threads = (threads / 2).max(1),
                Err(err) => {
                    tracing::warn!(
                        target = "kiln.cache",
                        error = %err,
                        "failed to start worker threads; hashing inline"
                    );
                    return WorkerPool::Inline;
                }
            }
        }
    }

    pub fn threads(&self) -> usize {
        match self {
            WorkerPool::Rayon(pool) => pool.current_num_threads(),
            WorkerPool::Inline => 1,
        }
    }

    /// Maps `items` in parallel. Results keep the order of `items`; if any
    /// item fails, one of the failures is returned.
    pub fn map_ordered<T, R, E, F>(&self, items: &[T], f: F) -> Result<Vec<R>, E>
    where
        T: Sync,
        R: Send,
        E: Send,
        F: Fn(&T) -> Result<R, E> + Sync + Send,
    {
        match self {
            WorkerPool::Rayon(pool) => pool.install(|| items.par_iter().map(&f).collect()),
            WorkerPool::Inline => items.iter().map(f).collect(),
        }
    }
}
