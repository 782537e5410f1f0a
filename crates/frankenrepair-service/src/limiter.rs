//! Admission limiter bounding concurrently running repair jobs.
//!
//! A counting semaphore built on `Mutex` + `Condvar`. Units are taken by the
//! dispatch loop and handed to the job as an owned [`JobPermit`]; the job
//! thread returns them by dropping the permit. Units that were never acquired
//! therefore cannot be released.
//!
//! # Invariants
//!
//! - Outstanding units never exceed capacity.
//! - A cancelled `acquire` takes nothing.
//! - Over-release is a debug assertion.
//!
//! `acquire` observes cancellation by waking every [`CANCEL_POLL_INTERVAL`].

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use frankenrepair_core::tracing_config::targets;
use frankenrepair_core::{CANCEL_POLL_INTERVAL, Cx, RepairError, RepairResult, checkpoint};

#[derive(Debug)]
struct State {
    available: usize,
    peak_in_use: usize,
}

/// Fixed-capacity admission limiter.
#[derive(Debug)]
pub struct JobLimiter {
    capacity: usize,
    state: Mutex<State>,
    cv: Condvar,
}

impl JobLimiter {
    /// Create a limiter admitting at most `capacity` concurrent units.
    ///
    /// # Errors
    ///
    /// [`RepairError::InvalidConfig`] if `capacity` is zero.
    pub fn new(capacity: usize) -> RepairResult<Arc<Self>> {
        if capacity == 0 {
            return Err(RepairError::InvalidConfig {
                field: "max_repair".to_owned(),
                value: "0".to_owned(),
                reason: "limiter capacity must be at least 1".to_owned(),
            });
        }
        Ok(Arc::new(Self {
            capacity,
            state: Mutex::new(State {
                available: capacity,
                peak_in_use: 0,
            }),
            cv: Condvar::new(),
        }))
    }

    fn lock_or_recover(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free units right now. Stale as soon as it returns.
    #[must_use]
    pub fn available(&self) -> usize {
        self.lock_or_recover().available
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    /// Highest number of simultaneously outstanding units observed.
    #[must_use]
    pub fn peak_in_use(&self) -> usize {
        self.lock_or_recover().peak_in_use
    }

    fn check_request(&self, n: usize) -> RepairResult<()> {
        if n == 0 || n > self.capacity {
            return Err(RepairError::InvalidConfig {
                field: "units".to_owned(),
                value: n.to_string(),
                reason: format!("must be between 1 and limiter capacity {}", self.capacity),
            });
        }
        Ok(())
    }

    fn grant(self: &Arc<Self>, st: &mut State, n: usize) -> JobPermit {
        st.available -= n;
        st.peak_in_use = st.peak_in_use.max(self.capacity - st.available);
        JobPermit {
            limiter: Arc::clone(self),
            units: n,
        }
    }

    /// Take `n` units without blocking. `None` if not enough are free.
    ///
    /// # Errors
    ///
    /// [`RepairError::InvalidConfig`] if `n` is zero or exceeds capacity.
    pub fn try_acquire(self: &Arc<Self>, n: usize) -> RepairResult<Option<JobPermit>> {
        self.check_request(n)?;
        let mut st = self.lock_or_recover();
        if st.available < n {
            return Ok(None);
        }
        Ok(Some(self.grant(&mut st, n)))
    }

    /// Take `n` units, blocking until they are free or `cx` is cancelled.
    ///
    /// # Errors
    ///
    /// [`RepairError::Cancelled`] with phase `admission` if `cx` is cancelled
    /// before the units were granted, or
    /// [`RepairError::InvalidConfig`] for an impossible request.
    pub fn acquire(self: &Arc<Self>, cx: &Cx, n: usize) -> RepairResult<JobPermit> {
        self.check_request(n)?;
        let mut st = self.lock_or_recover();
        loop {
            checkpoint(cx, "admission")?;
            if st.available >= n {
                return Ok(self.grant(&mut st, n));
            }
            st = self
                .cv
                .wait_timeout(st, CANCEL_POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Block until every unit is free at the same instant.
    ///
    /// This is the drain barrier: equivalent to acquiring the full capacity
    /// without cancellation and releasing it immediately. It proves zero
    /// outstanding jobs at one point in time; callers stop admitting new work
    /// first.
    pub fn wait_idle(&self) {
        let mut st = self.lock_or_recover();
        while st.available < self.capacity {
            st = self.cv.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait_idle`](Self::wait_idle) but gives up after `timeout`.
    /// Returns whether the limiter was observed idle.
    #[must_use]
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.lock_or_recover();
        while st.available < self.capacity {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            st = self
                .cv
                .wait_timeout(st, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    fn release(&self, n: usize) {
        let mut st = self.lock_or_recover();
        st.available += n;
        #[cfg(debug_assertions)]
        {
            if st.available > self.capacity && !std::thread::panicking() {
                panic!(
                    "JobLimiter over-release: available={} > capacity={}",
                    st.available, self.capacity
                );
            }
        }
        let in_use = self.capacity.saturating_sub(st.available);
        drop(st);
        // Waiters may need different unit counts; wake them all.
        self.cv.notify_all();
        tracing::trace!(target: targets::SERVICE, units = n, in_use, "admission units released");
    }
}

/// Owned admission units. Released when dropped, from whichever thread holds it.
#[derive(Debug)]
#[must_use = "JobPermit releases its units on drop"]
pub struct JobPermit {
    limiter: Arc<JobLimiter>,
    units: usize,
}

impl JobPermit {
    #[must_use]
    pub const fn units(&self) -> usize {
        self.units
    }
}

impl Drop for JobPermit {
    fn drop(&mut self) {
        self.limiter.release(self.units);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            JobLimiter::new(0),
            Err(RepairError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn permits_release_on_drop() {
        let limiter = JobLimiter::new(3).expect("limiter");
        let cx = Cx::for_testing();
        let a = limiter.acquire(&cx, 1).expect("a");
        let b = limiter.acquire(&cx, 2).expect("b");
        assert_eq!(limiter.available(), 0);
        assert_eq!(limiter.in_use(), 3);
        assert!(limiter.try_acquire(1).expect("valid").is_none());

        drop(b);
        assert_eq!(limiter.available(), 2);
        drop(a);
        assert_eq!(limiter.available(), 3);
        assert_eq!(limiter.peak_in_use(), 3);
    }

    #[test]
    fn impossible_requests_are_errors() {
        let limiter = JobLimiter::new(2).expect("limiter");
        assert!(limiter.try_acquire(0).is_err());
        assert!(limiter.try_acquire(3).is_err());
        assert!(limiter.acquire(&Cx::for_testing(), 3).is_err());
        assert_eq!(limiter.available(), 2);
    }

    #[test]
    fn permit_moves_across_threads() {
        let limiter = JobLimiter::new(1).expect("limiter");
        let permit = limiter.acquire(&Cx::for_testing(), 1).expect("permit");
        let handle = thread::spawn(move || {
            assert_eq!(permit.units(), 1);
            drop(permit);
        });
        handle.join().expect("job thread");
        assert_eq!(limiter.available(), 1);
    }

    #[test]
    fn acquire_blocks_until_release() {
        let limiter = JobLimiter::new(1).expect("limiter");
        let held = limiter.acquire(&Cx::for_testing(), 1).expect("held");
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            drop(held);
        });
        let start = Instant::now();
        let permit = limiter.acquire(&Cx::for_testing(), 1).expect("second");
        assert!(start.elapsed() >= Duration::from_millis(20));
        drop(permit);
        releaser.join().expect("releaser");
    }

    #[test]
    fn cancelled_acquire_takes_nothing() {
        let limiter = JobLimiter::new(1).expect("limiter");
        let _held = limiter.acquire(&Cx::for_testing(), 1).expect("held");

        let cx = Cx::for_testing();
        let err = thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(20));
                cx.set_cancel_requested(true);
            });
            limiter.acquire(&cx, 1).unwrap_err()
        });

        assert!(matches!(
            err,
            RepairError::Cancelled {
                phase: "admission",
                ..
            }
        ));
        assert_eq!(limiter.in_use(), 1);
    }

    #[test]
    fn already_cancelled_context_fails_even_with_free_units() {
        let limiter = JobLimiter::new(4).expect("limiter");
        let cx = Cx::for_testing();
        cx.set_cancel_requested(true);
        assert!(limiter.acquire(&cx, 1).is_err());
        assert_eq!(limiter.available(), 4);
    }

    #[test]
    fn wait_idle_waits_for_all_permits() {
        let limiter = JobLimiter::new(3).expect("limiter");
        let finished = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..3_u64 {
            let permit = limiter.acquire(&Cx::for_testing(), 1).expect("permit");
            let finished = Arc::clone(&finished);
            handles.push(thread::spawn(move || {
                thread::sleep(Duration::from_millis(10 + i * 15));
                finished.fetch_add(1, Ordering::SeqCst);
                drop(permit);
            }));
        }
        limiter.wait_idle();
        assert_eq!(finished.load(Ordering::SeqCst), 3);
        for handle in handles {
            handle.join().expect("job");
        }
    }

    #[test]
    fn wait_idle_timeout_reports_busy() {
        let limiter = JobLimiter::new(2).expect("limiter");
        let held = limiter.acquire(&Cx::for_testing(), 1).expect("held");
        assert!(!limiter.wait_idle_timeout(Duration::from_millis(20)));
        drop(held);
        assert!(limiter.wait_idle_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn concurrent_holders_never_exceed_capacity() {
        let limiter = JobLimiter::new(3).expect("limiter");
        let current = Arc::new(AtomicUsize::new(0));
        let high_water = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..12 {
            let permit = limiter.acquire(&Cx::for_testing(), 1).expect("permit");
            let current = Arc::clone(&current);
            let high_water = Arc::clone(&high_water);
            handles.push(thread::spawn(move || {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                high_water.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                current.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            }));
        }
        for handle in handles {
            handle.join().expect("job");
        }
        assert!(high_water.load(Ordering::SeqCst) <= 3);
        assert!(limiter.peak_in_use() <= 3);
        assert_eq!(limiter.available(), 3);
    }
}
