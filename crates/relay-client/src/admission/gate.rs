//! Admission gate for one traffic class.
//!
//! A gate is a FIFO queue plus two counters (threads, memory) under one
//! mutex. A unit is admitted only when nothing is queued ahead of it and
//! both budgets have room; otherwise it waits. Each admitted unit runs on
//! its own task and holds an [`AdmissionPermit`] whose drop returns the
//! budget and admits whatever now fits. The permit lives inside the task,
//! so the budget comes back on every exit path: normal return, panic, or
//! abort at shutdown.

use crate::domain::limits::GateLimits;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use relay_telemetry::metrics::{ACTIVE_HANDLERS, INBOUND_UNITS};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// A unit of inbound work.
pub type Job = BoxFuture<'static, ()>;

/// Inbound traffic class. Each class has its own independent budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficClass {
    Broadcast,
    Request,
}

impl TrafficClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Broadcast => "broadcast",
            Self::Request => "request",
        }
    }
}

impl fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a submitted unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Started immediately
    Admitted,
    /// Waiting behind earlier units or for budget
    Queued,
    /// Can never fit (larger than the whole memory budget) or the gate is shut down
    Rejected,
}

/// Point-in-time view of a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateSnapshot {
    pub threads_in_use: usize,
    pub memory_in_use: usize,
    pub queued: usize,
    pub admitted: u64,
    pub completed: u64,
    pub rejected: u64,
    pub peak_threads: usize,
}

struct QueuedUnit {
    size: usize,
    job: Job,
}

struct GateState {
    threads_in_use: usize,
    memory_in_use: usize,
    queue: VecDeque<QueuedUnit>,
    /// Abort handles of running units; `None` until the task is spawned
    running: HashMap<u64, Option<AbortHandle>>,
    next_seq: u64,
    closed: bool,
}

#[derive(Default)]
struct GateStats {
    admitted: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    peak_threads: AtomicUsize,
}

/// Joint thread and memory budget with FIFO backpressure.
pub struct Gate {
    class: TrafficClass,
    limits: GateLimits,
    runtime: Handle,
    state: Mutex<GateState>,
    stats: GateStats,
    idle: Notify,
}

impl Gate {
    pub fn new(class: TrafficClass, limits: GateLimits, runtime: Handle) -> Arc<Self> {
        if limits.is_degenerate() {
            warn!(
                class = %class,
                threads = limits.threads,
                memory = limits.memory,
                "Gate configured with a zero budget; its traffic will queue indefinitely"
            );
        }
        Arc::new(Self {
            class,
            limits,
            runtime,
            state: Mutex::new(GateState {
                threads_in_use: 0,
                memory_in_use: 0,
                queue: VecDeque::new(),
                running: HashMap::new(),
                next_seq: 0,
                closed: false,
            }),
            stats: GateStats::default(),
            idle: Notify::new(),
        })
    }

    pub fn class(&self) -> TrafficClass {
        self.class
    }

    pub fn limits(&self) -> GateLimits {
        self.limits
    }

    /// Submit a unit of `size` bytes.
    pub fn submit(self: &Arc<Self>, size: usize, job: Job) -> Admission {
        let mut state = self.state.lock();

        if state.closed {
            debug!(class = %self.class, "Gate shut down, discarding unit");
            return self.reject();
        }

        if !self.limits.is_degenerate() && size > self.limits.memory {
            warn!(
                class = %self.class,
                size = size,
                memory_limit = self.limits.memory,
                "Unit exceeds the whole memory allowance, rejecting"
            );
            return self.reject();
        }

        if state.queue.is_empty() && self.fits(&state, size) {
            let permit = self.admit(&mut state, size);
            drop(state);
            self.launch(permit, job);
            INBOUND_UNITS
                .with_label_values(&[self.class.as_str(), "admitted"])
                .inc();
            Admission::Admitted
        } else {
            state.queue.push_back(QueuedUnit { size, job });
            INBOUND_UNITS
                .with_label_values(&[self.class.as_str(), "queued"])
                .inc();
            debug!(
                class = %self.class,
                size = size,
                queued = state.queue.len(),
                threads_in_use = state.threads_in_use,
                memory_in_use = state.memory_in_use,
                "Unit queued"
            );
            Admission::Queued
        }
    }

    /// Refuse new work, drop queued units and abort running ones.
    ///
    /// Aborted tasks drop their permits, which returns their budget.
    /// Returns the number of running units that were aborted.
    pub fn shutdown(&self) -> usize {
        let (handles, discarded) = {
            let mut state = self.state.lock();
            state.closed = true;
            let discarded = state.queue.len();
            state.queue.clear();
            let handles: Vec<_> = state.running.values().flatten().cloned().collect();
            (handles, discarded)
        };

        for handle in &handles {
            handle.abort();
        }
        debug!(
            class = %self.class,
            aborted = handles.len(),
            discarded = discarded,
            "Gate shut down"
        );
        handles.len()
    }

    /// Wait until no admitted unit is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.lock().threads_in_use == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn snapshot(&self) -> GateSnapshot {
        let state = self.state.lock();
        GateSnapshot {
            threads_in_use: state.threads_in_use,
            memory_in_use: state.memory_in_use,
            queued: state.queue.len(),
            admitted: self.stats.admitted.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            peak_threads: self.stats.peak_threads.load(Ordering::Relaxed),
        }
    }

    fn reject(&self) -> Admission {
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        INBOUND_UNITS
            .with_label_values(&[self.class.as_str(), "rejected"])
            .inc();
        Admission::Rejected
    }

    fn fits(&self, state: &GateState, size: usize) -> bool {
        !self.limits.is_degenerate()
            && state.threads_in_use < self.limits.threads
            && state
                .memory_in_use
                .checked_add(size)
                .is_some_and(|total| total <= self.limits.memory)
    }

    /// Take budget for a unit. Must be followed by `launch` once the lock is released.
    fn admit(self: &Arc<Self>, state: &mut GateState, size: usize) -> AdmissionPermit {
        state.threads_in_use += 1;
        state.memory_in_use += size;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.running.insert(seq, None);

        self.stats.admitted.fetch_add(1, Ordering::Relaxed);
        self.stats
            .peak_threads
            .fetch_max(state.threads_in_use, Ordering::Relaxed);
        ACTIVE_HANDLERS
            .with_label_values(&[self.class.as_str()])
            .inc();

        AdmissionPermit {
            gate: Arc::clone(self),
            size,
            seq,
        }
    }

    /// Spawn an admitted unit. Called without the state lock held: a spawn on
    /// a runtime that is shutting down drops the task, and with it the permit,
    /// on this thread.
    fn launch(&self, permit: AdmissionPermit, job: Job) {
        let seq = permit.seq;
        let task = self.runtime.spawn(async move {
            let _permit = permit;
            job.await;
        });

        let mut state = self.state.lock();
        let closed = state.closed;
        match state.running.get_mut(&seq) {
            Some(slot) if !closed => *slot = Some(task.abort_handle()),
            Some(_) => task.abort(),
            // Already finished and released
            None => {}
        }
    }

    fn release(self: &Arc<Self>, size: usize, seq: u64) {
        let ready = {
            let mut state = self.state.lock();
            state.threads_in_use = state.threads_in_use.saturating_sub(1);
            state.memory_in_use = state.memory_in_use.saturating_sub(size);
            state.running.remove(&seq);

            self.stats.completed.fetch_add(1, Ordering::Relaxed);
            ACTIVE_HANDLERS
                .with_label_values(&[self.class.as_str()])
                .dec();

            if state.threads_in_use == 0 {
                self.idle.notify_waiters();
            }

            if state.closed {
                Vec::new()
            } else {
                self.pump(&mut state)
            }
        };

        for (permit, job) in ready {
            self.launch(permit, job);
        }
    }

    /// Admit queued units, in order, while the head fits.
    fn pump(self: &Arc<Self>, state: &mut GateState) -> Vec<(AdmissionPermit, Job)> {
        let mut ready = Vec::new();
        while state
            .queue
            .front()
            .is_some_and(|head| self.fits(state, head.size))
        {
            if let Some(unit) = state.queue.pop_front() {
                let permit = self.admit(state, unit.size);
                ready.push((permit, unit.job));
            }
        }
        ready
    }
}

/// Budget held by one admitted unit. Returned on drop.
pub struct AdmissionPermit {
    gate: Arc<Gate>,
    size: usize,
    seq: u64,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.gate.release(self.size, self.seq);
    }
}
