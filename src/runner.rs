//! The polling loop that drives one pooler.
//!
//! A [`Runner`] owns a background task that repeatedly fetches facts from
//! each of its pooler's sources, dispatches them to handlers, and records
//! progress in the [`CheckpointStore`]. Cancellation is cooperative: a stop
//! signal interrupts idle and backoff sleeps immediately but is only observed
//! between batches, never while a handler is running.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, Notify, watch};
use tokio::task::JoinHandle;

use crate::checkpoint::{CheckpointKey, CheckpointStore};
use crate::pooler::{EventHandler, SubscriptionPooler, SubscriptionSource};

/// Tuning for runner polling and failure handling.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use ses::RunnerConfig;
///
/// let config = RunnerConfig {
///     poll_interval: Duration::from_millis(50),
///     ..RunnerConfig::default()
/// };
/// assert_eq!(config.batch_size, 256);
/// ```
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Sleep between polls when no source had new facts.
    ///
    /// Defaults to 1 second. [`Runner::wake`] cuts a sleep short.
    pub poll_interval: Duration,

    /// Maximum number of facts fetched from a source per batch.
    pub batch_size: usize,

    /// Failed attempts on one batch tolerated before the runner halts.
    pub max_retries: u32,

    /// Delay before the first retry of a failed batch.
    ///
    /// Doubles after each further failure, up to
    /// [`retry_max_delay`](RunnerConfig::retry_max_delay).
    pub retry_base_delay: Duration,

    /// Upper bound on the retry delay.
    pub retry_max_delay: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 256,
            max_retries: 5,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(10),
        }
    }
}

/// A pooler with every contract name resolved.
pub(crate) struct ResolvedPooler {
    pub(crate) name: String,
    pub(crate) pooler: Arc<dyn SubscriptionPooler>,
    pub(crate) sources: Vec<(String, Arc<dyn SubscriptionSource>)>,
    pub(crate) handlers: Vec<(String, Arc<dyn EventHandler>)>,
}

/// How a runner's task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Stopped,
    Halted,
}

struct RunningTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Exit>,
}

struct Shared {
    pooler: ResolvedPooler,
    checkpoints: Arc<dyn CheckpointStore>,
    config: RunnerConfig,
    wake: Notify,
}

/// Execution state for one pooler: stopped or running.
///
/// [`start`](Runner::start) spawns the polling task on the current tokio
/// runtime and is idempotent while the task is alive. A runner that halted
/// after exhausting its retries counts as stopped and can be started again.
pub struct Runner {
    shared: Arc<Shared>,
    task: Mutex<Option<RunningTask>>,
    /// Task being stopped. Held across the join so concurrent `stop` calls
    /// all wait for the same task.
    stopping: AsyncMutex<Option<JoinHandle<Exit>>>,
}

impl Runner {
    pub(crate) fn new(
        pooler: ResolvedPooler,
        checkpoints: Arc<dyn CheckpointStore>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                pooler,
                checkpoints,
                config,
                wake: Notify::new(),
            }),
            task: Mutex::new(None),
            stopping: AsyncMutex::new(None),
        }
    }

    /// Contract name of the pooler this runner drives.
    pub fn name(&self) -> &str {
        &self.shared.pooler.name
    }

    pub(crate) fn pooler(&self) -> &Arc<dyn SubscriptionPooler> {
        &self.shared.pooler.pooler
    }

    /// Returns `true` while the polling task is alive.
    pub fn is_running(&self) -> bool {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        task.as_ref().is_some_and(|t| !t.handle.is_finished())
    }

    /// Spawn the polling task if it is not already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(Arc::clone(&self.shared), shutdown_rx));
        *task = Some(RunningTask {
            shutdown_tx,
            handle,
        });
    }

    /// Signal the task to stop and wait for it to finish.
    ///
    /// A handler in flight runs to completion first. Concurrent callers all
    /// return once the task has finished. Calling `stop` on a stopped runner
    /// returns immediately.
    pub async fn stop(&self) {
        let mut stopping = self.stopping.lock().await;
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.shutdown_tx.send(true);
            *stopping = Some(task.handle);
        }
        let Some(handle) = stopping.as_mut() else {
            return;
        };
        // Cleared only after the join so a cancelled `stop` leaves the handle
        // for the next caller.
        let joined = handle.await;
        *stopping = None;
        if let Err(e) = joined {
            tracing::error!(pooler = %self.name(), error = %e, "runner task panicked");
        }
    }

    /// Cut the current idle sleep short and poll immediately.
    pub fn wake(&self) {
        self.shared.wake.notify_one();
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        let task = self.task.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = task.take() {
            let _ = task.shutdown_tx.send(true);
        }
    }
}

/// Per-source cursor: one position per handler, aligned with
/// `ResolvedPooler::handlers`.
type Cursor = Vec<u64>;

async fn run_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) -> Exit {
    let pooler = &shared.pooler;
    tracing::info!(pooler = %pooler.name, "runner started");

    let mut cursors = match retrying(&shared, &mut shutdown_rx, "load checkpoints", || {
        load_cursors(&shared)
    })
    .await
    {
        Attempt::Done(cursors) => cursors,
        Attempt::Stopped => return stopped(pooler),
        Attempt::Failed => return halted(pooler),
    };

    loop {
        if *shutdown_rx.borrow() {
            return stopped(pooler);
        }

        let mut progressed = false;
        if !pooler.handlers.is_empty() {
            for (index, (source_name, source)) in pooler.sources.iter().enumerate() {
                let cursor = &cursors[index];
                let outcome = retrying(&shared, &mut shutdown_rx, "dispatch batch", || {
                    dispatch_batch(&shared, source_name, source.as_ref(), cursor)
                })
                .await;
                match outcome {
                    Attempt::Done(Some(next)) => {
                        cursors[index] = next;
                        progressed = true;
                    }
                    Attempt::Done(None) => {}
                    Attempt::Stopped => return stopped(pooler),
                    Attempt::Failed => return halted(pooler),
                }
                if *shutdown_rx.borrow() {
                    return stopped(pooler);
                }
            }
        }

        if !progressed {
            tokio::select! {
                _ = tokio::time::sleep(shared.config.poll_interval) => {}
                _ = shared.wake.notified() => {}
                _ = shutdown_rx.changed() => return stopped(pooler),
            }
        }
    }
}

fn stopped(pooler: &ResolvedPooler) -> Exit {
    tracing::info!(pooler = %pooler.name, "runner stopped");
    Exit::Stopped
}

fn halted(pooler: &ResolvedPooler) -> Exit {
    tracing::error!(pooler = %pooler.name, "runner halted after exhausting retries");
    Exit::Halted
}

enum Attempt<T> {
    Done(T),
    Stopped,
    Failed,
}

/// Run `op` until it succeeds, backing off between failures.
///
/// Gives up after `max_retries` retries. A stop signal during a backoff
/// sleep ends the attempt immediately.
async fn retrying<T, F, Fut>(
    shared: &Shared,
    shutdown_rx: &mut watch::Receiver<bool>,
    what: &str,
    mut op: F,
) -> Attempt<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let config = &shared.config;
    let mut delay = config.retry_base_delay;
    let mut failures = 0u32;
    loop {
        match op().await {
            Ok(value) => return Attempt::Done(value),
            Err(e) => {
                failures += 1;
                if failures > config.max_retries {
                    tracing::error!(
                        pooler = %shared.pooler.name,
                        error = %e,
                        failures,
                        "{what} failed, giving up"
                    );
                    return Attempt::Failed;
                }
                tracing::warn!(
                    pooler = %shared.pooler.name,
                    error = %e,
                    failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "{what} failed, will retry"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => return Attempt::Stopped,
                }
                delay = next_delay(delay, config.retry_max_delay);
            }
        }
    }
}

/// Double `delay`, capped at `max`.
fn next_delay(delay: Duration, max: Duration) -> Duration {
    delay.saturating_mul(2).min(max)
}

async fn load_cursors(shared: &Shared) -> io::Result<Vec<Cursor>> {
    let pooler = &shared.pooler;
    let mut cursors = Vec::with_capacity(pooler.sources.len());
    for (source_name, _) in &pooler.sources {
        let mut cursor = Vec::with_capacity(pooler.handlers.len());
        for (handler_name, _) in &pooler.handlers {
            let key = CheckpointKey::new(&pooler.name, source_name, handler_name);
            cursor.push(shared.checkpoints.get(&key).await?.unwrap_or(0));
        }
        cursors.push(cursor);
    }
    Ok(cursors)
}

/// Fetch one batch from `source` starting after the slowest handler, deliver
/// each fact to every handler that has not yet seen it and wants it, then
/// persist the new positions.
///
/// Returns `None` if the source had nothing new, otherwise the advanced
/// cursor. On error nothing is persisted and `cursor` remains valid.
async fn dispatch_batch(
    shared: &Shared,
    source_name: &str,
    source: &dyn SubscriptionSource,
    cursor: &[u64],
) -> io::Result<Option<Cursor>> {
    let pooler = &shared.pooler;
    let from = cursor.iter().copied().min().unwrap_or(0);
    let batch = source.fetch(from, shared.config.batch_size).await?;
    let Some(last) = batch.last() else {
        return Ok(None);
    };
    let last_position = last.global_position;

    tracing::debug!(
        pooler = %pooler.name,
        source = source_name,
        from,
        count = batch.len(),
        "dispatching batch"
    );

    for event in &batch {
        for ((_, handler), &position) in pooler.handlers.iter().zip(cursor) {
            if event.global_position > position && handler.handles(&event.contract_name) {
                handler.handle(event).await?;
            }
        }
    }

    let next: Cursor = cursor.iter().map(|&p| p.max(last_position)).collect();
    let rows: Vec<(CheckpointKey, u64)> = pooler
        .handlers
        .iter()
        .zip(cursor.iter().zip(&next))
        .filter(|(_, (old, new))| old != new)
        .map(|((handler_name, _), (_, &new))| {
            (CheckpointKey::new(&pooler.name, source_name, handler_name), new)
        })
        .collect();
    shared.checkpoints.save(&rows).await?;

    tracing::debug!(
        pooler = %pooler.name,
        source = source_name,
        position = last_position,
        "checkpoint advanced"
    );
    Ok(Some(next))
}
