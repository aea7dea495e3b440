//! Concurrency slots, throughput accounting, cancellation and progress.
//!
//! Every extraction takes a slot from a shared [`ResourceLimiter`] before it
//! does any work. The slot is held by a [`Job`] and given back when the job
//! is dropped, so an error unwinding through `?` still frees it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{ExtractError, Result};

/// Cooperative cancellation flag shared between a caller and its workers.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte counter readable from any thread.
#[derive(Debug, Default)]
pub struct Progress {
    done: AtomicU64,
    total: AtomicU64,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_total(&self, bytes: u64) {
        self.total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add(&self, bytes: u64) {
        self.done.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

struct ThroughputWindow {
    started: Instant,
    bytes: u64,
}

struct LimiterInner {
    max_jobs: usize,
    max_throughput: u64,
    running: Mutex<usize>,
    slot_freed: Condvar,
    window: Mutex<ThroughputWindow>,
    total_bytes: AtomicU64,
}

impl LimiterInner {
    fn running(&self) -> MutexGuard<'_, usize> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Counting semaphore with a per-second byte budget.
#[derive(Clone)]
pub struct ResourceLimiter {
    inner: Arc<LimiterInner>,
}

impl ResourceLimiter {
    /// `max_throughput` is bytes per second; 0 disables throttling.
    pub fn new(max_jobs: usize, max_throughput: u64) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                max_jobs: max_jobs.max(1),
                max_throughput,
                running: Mutex::new(0),
                slot_freed: Condvar::new(),
                window: Mutex::new(ThroughputWindow {
                    started: Instant::now(),
                    bytes: 0,
                }),
                total_bytes: AtomicU64::new(0),
            }),
        }
    }

    /// Wait for a free slot. Gives up with `Cancelled` if the token fires
    /// while waiting.
    pub fn begin(
        &self,
        archive: &str,
        description: impl Into<String>,
        size: u64,
        token: &CancellationToken,
    ) -> Result<Job> {
        let description = description.into();
        let mut running = self.inner.running();
        while *running >= self.inner.max_jobs {
            if token.is_cancelled() {
                return Err(ExtractError::Cancelled {
                    archive: archive.to_string(),
                });
            }
            running = self
                .inner
                .slot_freed
                .wait_timeout(running, Duration::from_millis(100))
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        if token.is_cancelled() {
            return Err(ExtractError::Cancelled {
                archive: archive.to_string(),
            });
        }
        *running += 1;
        drop(running);

        debug!("Job started: {} ({} bytes)", description, size);
        Ok(Job {
            limiter: self.inner.clone(),
            description,
            size,
            reported: AtomicU64::new(0),
        })
    }

    pub fn running_jobs(&self) -> usize {
        *self.inner.running()
    }

    pub fn max_jobs(&self) -> usize {
        self.inner.max_jobs
    }

    /// Bytes reported by all jobs so far.
    pub fn total_bytes(&self) -> u64 {
        self.inner.total_bytes.load(Ordering::Relaxed)
    }
}

/// A held limiter slot.
pub struct Job {
    limiter: Arc<LimiterInner>,
    description: String,
    size: u64,
    reported: AtomicU64,
}

impl Job {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn reported(&self) -> u64 {
        self.reported.load(Ordering::Relaxed)
    }

    /// Account for processed bytes, sleeping if the shared budget for the
    /// current second is spent.
    pub fn report(&self, bytes: u64) {
        self.reported.fetch_add(bytes, Ordering::Relaxed);
        self.limiter.total_bytes.fetch_add(bytes, Ordering::Relaxed);

        let max = self.limiter.max_throughput;
        if max == 0 {
            return;
        }

        let pause = {
            let mut window = self
                .limiter
                .window
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let elapsed = window.started.elapsed();
            if elapsed >= Duration::from_secs(1) {
                window.started = Instant::now();
                window.bytes = 0;
            }
            window.bytes += bytes;
            if window.bytes > max {
                Some(Duration::from_secs(1).saturating_sub(window.started.elapsed()))
            } else {
                None
            }
        };

        if let Some(pause) = pause {
            std::thread::sleep(pause);
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        let mut running = self.limiter.running();
        *running = running.saturating_sub(1);
        drop(running);
        self.limiter.slot_freed.notify_one();
        debug!("Job finished: {}", self.description);
    }
}
