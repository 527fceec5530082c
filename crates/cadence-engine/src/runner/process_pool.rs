// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded pool of worker processes.
//!
//! The pool keeps `min_processes <= busy + idle <= max_processes`. A submission
//! takes an idle worker if one exists, spawns a new one while under the cap, and
//! otherwise waits in a FIFO queue. Workers are single-use unless
//! `reuse_processes` is set, in which case they return to the idle set after a
//! clean reply.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::traits::{Executor, LaunchOptions, PoolStats, Result, RunOutcome, RunnerError};
use super::worker::Worker;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct ProcessPoolConfig {
    /// Worker program.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Extra environment for workers.
    pub env: HashMap<String, String>,
    /// Workers kept alive even when idle.
    pub min_processes: usize,
    /// Cap on `busy + idle`.
    pub max_processes: usize,
    /// Return workers to the idle set after a clean reply.
    pub reuse_processes: bool,
    /// Ceiling for any single invocation.
    pub execution_timeout: Duration,
    /// Idle workers above the minimum are reclaimed after this long.
    pub idle_timeout: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub cancel_grace: Duration,
}

impl ProcessPoolConfig {
    /// Config for `program` with default limits.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            min_processes: 0,
            max_processes: 4,
            reuse_processes: false,
            execution_timeout: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(60),
            cancel_grace: Duration::from_secs(5),
        }
    }

    /// Build from a command line: program followed by arguments.
    pub fn from_command(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| RunnerError::SpawnFailed("worker command is empty".into()))?;
        let mut config = Self::new(program.clone());
        config.args = args.to_vec();
        Ok(config)
    }
}

enum Slot {
    /// A live worker handed over from the idle set or a finished reuse run.
    Reuse(Worker),
    /// Permission to spawn a fresh worker.
    Spawn,
}

struct IdleWorker {
    worker: Worker,
    since: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleWorker>,
    busy: usize,
    waiters: VecDeque<oneshot::Sender<Slot>>,
    active: HashMap<String, CancellationToken>,
    closed: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.busy + self.idle.len()
    }
}

/// Executor backed by local worker processes.
pub struct ProcessPool {
    config: ProcessPoolConfig,
    state: Mutex<PoolState>,
    next_worker_id: AtomicU64,
}

impl ProcessPool {
    /// Create a pool. No workers are spawned until [`ProcessPool::warm_up`] or
    /// the first submission.
    pub fn new(mut config: ProcessPoolConfig) -> Self {
        config.max_processes = config.max_processes.max(1);
        config.min_processes = config.min_processes.min(config.max_processes);
        Self {
            config,
            state: Mutex::new(PoolState::default()),
            next_worker_id: AtomicU64::new(1),
        }
    }

    /// Pool configuration.
    pub fn config(&self) -> &ProcessPoolConfig {
        &self.config
    }

    /// Spawn workers up to `min_processes`. Returns how many were started.
    pub async fn warm_up(&self) -> usize {
        let spawned = self.replenish().await;
        if spawned > 0 {
            info!(
                spawned,
                min_processes = self.config.min_processes,
                "Process pool warmed up"
            );
        }
        spawned
    }

    fn spawn_worker(&self) -> Result<Worker> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        Worker::spawn(&self.config, id)
    }

    async fn acquire(&self, token: &CancellationToken) -> Result<Option<Slot>> {
        let mut rx = {
            let mut st = self.state.lock().await;
            if st.closed {
                return Err(RunnerError::PoolClosed);
            }
            if let Some(idle) = st.idle.pop_back() {
                st.busy += 1;
                return Ok(Some(Slot::Reuse(idle.worker)));
            }
            if st.total() < self.config.max_processes {
                st.busy += 1;
                return Ok(Some(Slot::Spawn));
            }
            let (tx, rx) = oneshot::channel();
            st.waiters.push_back(tx);
            debug!(queued = st.waiters.len(), "All workers busy, queueing run");
            rx
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                rx.close();
                // A slot may have been handed over just before close().
                if let Ok(slot) = rx.try_recv() {
                    self.release(slot).await;
                }
                Ok(None)
            }
            slot = &mut rx => slot.map(Some).map_err(|_| RunnerError::PoolClosed),
        }
    }

    /// Give a slot back: first live waiter wins, otherwise it is freed.
    async fn release(&self, mut slot: Slot) {
        let mut st = self.state.lock().await;
        if !st.closed {
            while let Some(tx) = st.waiters.pop_front() {
                match tx.send(slot) {
                    Ok(()) => return,
                    Err(returned) => slot = returned,
                }
            }
        }
        st.busy = st.busy.saturating_sub(1);
        if let Slot::Reuse(worker) = slot
            && !st.closed
        {
            st.idle.push_back(IdleWorker {
                worker,
                since: Instant::now(),
            });
        }
    }

    /// Top the pool up to `min_processes`.
    async fn replenish(&self) -> usize {
        let mut spawned = 0;
        loop {
            {
                let mut st = self.state.lock().await;
                if st.closed || st.total() >= self.config.min_processes {
                    break;
                }
                st.busy += 1;
            }
            match self.spawn_worker() {
                Ok(worker) => {
                    self.release(Slot::Reuse(worker)).await;
                    spawned += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to spawn warm worker");
                    let mut st = self.state.lock().await;
                    st.busy = st.busy.saturating_sub(1);
                    break;
                }
            }
        }
        spawned
    }

    /// Drop dead idle workers and reclaim those idle longer than `idle_timeout`
    /// while above the minimum.
    async fn reap_idle(&self) -> usize {
        let expired: Vec<Worker> = {
            let mut st = self.state.lock().await;
            st.idle.retain_mut(|idle| idle.worker.is_alive());

            let mut expired = Vec::new();
            while st.total() > self.config.min_processes {
                match st.idle.front() {
                    Some(front) if front.since.elapsed() >= self.config.idle_timeout => {}
                    _ => break,
                }
                if let Some(idle) = st.idle.pop_front() {
                    expired.push(idle.worker);
                }
            }
            expired
        };

        let count = expired.len();
        for mut worker in expired {
            debug!(worker_id = worker.id(), "Reclaiming idle worker");
            worker.terminate(self.config.cancel_grace).await;
        }
        count
    }

    async fn run_in_slot(&self, options: &LaunchOptions, token: &CancellationToken) -> RunOutcome {
        if token.is_cancelled() {
            return RunOutcome::cancelled("run was cancelled before it started");
        }
        let slot = match self.acquire(token).await {
            Ok(Some(slot)) => slot,
            Ok(None) => return RunOutcome::cancelled("run was cancelled while queued"),
            Err(e) => return e.into(),
        };

        let mut worker = match slot {
            Slot::Reuse(mut worker) => {
                if worker.is_alive() {
                    worker
                } else {
                    debug!(worker_id = worker.id(), "Idle worker died, spawning a replacement");
                    drop(worker);
                    match self.spawn_worker() {
                        Ok(worker) => worker,
                        Err(e) => {
                            self.release(Slot::Spawn).await;
                            return e.into();
                        }
                    }
                }
            }
            Slot::Spawn => match self.spawn_worker() {
                Ok(worker) => worker,
                Err(e) => {
                    warn!(run_id = %options.run_id, error = %e, "Failed to spawn worker");
                    self.release(Slot::Spawn).await;
                    return e.into();
                }
            },
        };

        let timeout = options
            .timeout
            .map_or(self.config.execution_timeout, |t| {
                t.min(self.config.execution_timeout)
            });

        let (outcome, reusable) = worker
            .invoke(
                options,
                token,
                timeout,
                self.config.cancel_grace,
                !self.config.reuse_processes,
            )
            .await;

        if reusable && self.config.reuse_processes {
            self.release(Slot::Reuse(worker)).await;
        } else {
            drop(worker);
            self.release(Slot::Spawn).await;
        }
        outcome
    }
}

#[async_trait]
impl Executor for ProcessPool {
    fn executor_type(&self) -> &'static str {
        "process_pool"
    }

    async fn execute(&self, options: LaunchOptions) -> RunOutcome {
        let started = Instant::now();
        let token = options.cancel.clone();
        {
            let mut st = self.state.lock().await;
            if st.closed {
                return RunnerError::PoolClosed.into();
            }
            st.active.insert(options.run_id.clone(), token.clone());
        }

        let mut outcome = self.run_in_slot(&options, &token).await;

        self.state.lock().await.active.remove(&options.run_id);
        self.replenish().await;

        outcome.duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            run_id = %options.run_id,
            status = %outcome.status,
            duration_ms = outcome.duration_ms,
            "Execution finished"
        );
        outcome
    }

    async fn cancel(&self, run_id: &str) -> bool {
        let st = self.state.lock().await;
        match st.active.get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn stats(&self) -> PoolStats {
        let st = self.state.lock().await;
        PoolStats {
            idle: st.idle.len(),
            busy: st.busy,
            queued: st.waiters.iter().filter(|tx| !tx.is_closed()).count(),
            min_processes: self.config.min_processes,
            max_processes: self.config.max_processes,
        }
    }

    async fn maintain(&self) {
        let reaped = self.reap_idle().await;
        let spawned = self.replenish().await;
        if reaped > 0 || spawned > 0 {
            debug!(reaped, spawned, "Process pool maintenance");
        }
    }

    async fn shutdown(&self) {
        let idle: Vec<IdleWorker> = {
            let mut st = self.state.lock().await;
            st.closed = true;
            // Dropping the senders fails every queued submission.
            st.waiters.clear();
            st.idle.drain(..).collect()
        };
        info!(idle = idle.len(), "Shutting down process pool");
        for mut idle in idle {
            idle.worker.terminate(self.config.cancel_grace).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_command() {
        let config =
            ProcessPoolConfig::from_command(&["python3".into(), "-m".into(), "host".into()])
                .unwrap();
        assert_eq!(config.program, "python3");
        assert_eq!(config.args, vec!["-m", "host"]);

        assert!(ProcessPoolConfig::from_command(&[]).is_err());
    }

    #[test]
    fn test_new_clamps_limits() {
        let mut config = ProcessPoolConfig::new("sh");
        config.min_processes = 5;
        config.max_processes = 0;
        let pool = ProcessPool::new(config);
        assert_eq!(pool.config().max_processes, 1);
        assert_eq!(pool.config().min_processes, 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_yields_failed_outcome() {
        let pool = ProcessPool::new(ProcessPoolConfig::new("/nonexistent/cadence-worker"));
        let outcome = pool
            .execute(LaunchOptions {
                run_id: "r-1".into(),
                action: crate::registry::ActionRef {
                    action_id: "a".into(),
                    package_id: "p".into(),
                    name: "a".into(),
                    entry_point: "a".into(),
                },
                input: serde_json::json!({}),
                artifacts_dir: std::env::temp_dir(),
                timeout: None,
                cancel: CancellationToken::new(),
            })
            .await;

        assert_eq!(outcome.status, cadence_core::status::RunStatus::Failed);
        assert!(outcome.error.unwrap().contains("spawn failed"));
        assert_eq!(pool.stats().await.busy, 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_run() {
        let pool = ProcessPool::new(ProcessPoolConfig::new("sh"));
        assert!(!pool.cancel("nope").await);
    }
}
