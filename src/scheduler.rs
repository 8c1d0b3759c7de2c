//! Job System
//!
//! A fixed worker-thread pool executing island-solve and narrowphase batch
//! jobs. Capacities (jobs, barriers, threads) are validated at construction —
//! exceeding them is a configuration error at setup, never a runtime race.
//!
//! `step` is synchronous from the caller's perspective: every dispatch here
//! joins all its jobs before returning (the barrier is implicit in the
//! fork-join structure). There is no cooperative suspension, only data
//! parallelism across independent work items.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::error::{PhysicsError, PhysicsResult};

/// Job system capacities.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobSystemConfig {
    /// Maximum concurrent jobs per dispatch
    pub max_jobs: u32,
    /// Maximum barriers (independent fork-join scopes) per step
    pub max_barriers: u32,
    /// Worker threads; -1 picks the machine's available parallelism
    pub num_threads: i32,
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        Self { max_jobs: 1024, max_barriers: 8, num_threads: -1 }
    }
}

/// Fixed worker pool for the simulation step.
pub struct JobSystem {
    config: JobSystemConfig,
    #[cfg(feature = "parallel")]
    pool: rayon::ThreadPool,
    threads: usize,
}

impl JobSystem {
    /// Build the pool. Fails on zero capacities or a nonsensical thread count.
    pub fn new(config: JobSystemConfig) -> PhysicsResult<Self> {
        if config.max_jobs == 0 {
            return Err(PhysicsError::InvalidConfiguration { reason: "max_jobs must be > 0" });
        }
        if config.max_barriers == 0 {
            return Err(PhysicsError::InvalidConfiguration { reason: "max_barriers must be > 0" });
        }
        if config.num_threads == 0 || config.num_threads < -1 {
            return Err(PhysicsError::InvalidConfiguration {
                reason: "num_threads must be -1 (auto) or >= 1",
            });
        }

        let threads = if config.num_threads < 0 {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        } else {
            config.num_threads as usize
        };

        #[cfg(feature = "parallel")]
        {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("physics-worker-{i}"))
                .build()
                .map_err(|_| PhysicsError::InvalidConfiguration {
                    reason: "failed to build worker thread pool",
                })?;
            Ok(Self { config, pool, threads })
        }
        #[cfg(not(feature = "parallel"))]
        {
            Ok(Self { config, threads })
        }
    }

    /// Build with default capacities and automatic thread count.
    pub fn with_default_config() -> PhysicsResult<Self> {
        Self::new(JobSystemConfig::default())
    }

    /// Worker thread count.
    #[inline]
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads
    }

    /// Configured capacities.
    #[inline]
    #[must_use]
    pub fn config(&self) -> JobSystemConfig {
        self.config
    }

    /// Run `count` independent work items and join them all (one barrier).
    ///
    /// Work item count may exceed `max_jobs`; items are then strided across
    /// exactly `max_jobs` jobs. Item execution order across workers is
    /// unspecified — callers must only submit mutually independent items.
    pub(crate) fn dispatch<F>(&self, count: usize, f: F)
    where
        F: Fn(usize) + Send + Sync,
    {
        if count == 0 {
            return;
        }
        if count == 1 || self.threads == 1 {
            for i in 0..count {
                f(i);
            }
            return;
        }

        let jobs = count.min(self.config.max_jobs as usize);

        #[cfg(feature = "parallel")]
        {
            self.pool.install(|| {
                (0..jobs).into_par_iter().for_each(|job| {
                    let mut i = job;
                    while i < count {
                        f(i);
                        i += jobs;
                    }
                });
            });
        }
        #[cfg(not(feature = "parallel"))]
        {
            let _ = jobs;
            for i in 0..count {
                f(i);
            }
        }
    }
}

impl core::fmt::Debug for JobSystem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobSystem")
            .field("threads", &self.threads)
            .field("max_jobs", &self.config.max_jobs)
            .field("max_barriers", &self.config.max_barriers)
            .finish()
    }
}
