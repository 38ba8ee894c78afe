//! Serial execution of sync work.
//!
//! A single worker task owns the queue. Triggers are recorded while a job
//! runs and picked by priority once it completes:
//! user activity, then connectivity, then the periodic tick, then ad hoc
//! tasks in arrival order. Observers get one [`OperationEvent`] per job over
//! a broadcast channel, which never blocks the worker.

pub mod connectivity;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::constants::{EVENT_CHANNEL_SIZE, TRIGGER_QUEUE_SIZE};
use crate::error::{Result, SyncError};
use crate::sync::PassReport;
use crate::sync::model::SyncScope;

pub use connectivity::ConnectivityMonitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    UserActivity,
    Connectivity,
    Periodic,
    AdHoc,
}

/// Work the executor knows how to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// A full reconciliation pass over the scope.
    Sync(SyncScope),
    /// Push pending flags and messages without folder resync.
    Push,
    /// Drop every local record, then resync from scratch.
    Wipe,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Sync(scope) => write!(f, "sync ({})", scope),
            Operation::Push => write!(f, "push"),
            Operation::Wipe => write!(f, "wipe"),
        }
    }
}

/// Runs one operation at a time on behalf of the scheduler.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, operation: Operation) -> BoxFuture<'_, Result<PassReport>>;
}

/// Posted after every completed job.
#[derive(Debug, Clone)]
pub struct OperationEvent {
    pub trigger: TriggerKind,
    pub operation: Operation,
    pub outcome: Result<PassReport, String>,
}

impl OperationEvent {
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// `None` disables the periodic tick.
    pub periodic_interval: Option<Duration>,
    pub connectivity_debounce: Duration,
}

enum Command {
    UserActivity(SyncScope),
    Connectivity(bool),
    AdHoc(Operation, oneshot::Sender<Result<PassReport>>),
    Stop,
}

struct Job {
    trigger: TriggerKind,
    operation: Operation,
    epoch: Option<u64>,
    reply: Option<oneshot::Sender<Result<PassReport>>>,
}

struct Running<'a> {
    job: Job,
    future: BoxFuture<'a, Result<PassReport>>,
}

/// Handle to the worker task.
pub struct Scheduler {
    cmd_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<OperationEvent>,
    task: JoinHandle<()>,
}

impl Scheduler {
    /// Spawn the worker. Connectivity is evaluated right away, so starting
    /// while connected syncs once per connectivity epoch.
    pub fn start(
        executor: Arc<dyn Executor>,
        connectivity: Arc<ConnectivityMonitor>,
        config: SchedulerConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(TRIGGER_QUEUE_SIZE);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let now = Instant::now();
        let worker = Worker {
            executor,
            pending_connectivity: connectivity.pending_epoch().is_some(),
            connectivity,
            periodic_at: config.periodic_interval.map(|interval| now + interval),
            connectivity_at: None,
            config,
            events: events.clone(),
            pending_user: None,
            pending_periodic: false,
            ad_hoc: VecDeque::new(),
            stopping: false,
        };
        let task = tokio::spawn(worker.run(cmd_rx));

        Self {
            cmd_tx,
            events,
            task,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.events.subscribe()
    }

    /// Highest priority: runs now when idle, next otherwise.
    pub async fn user_activity(&self, scope: SyncScope) {
        self.send(Command::UserActivity(scope)).await;
    }

    /// Report the current network state.
    pub async fn connectivity_changed(&self, available: bool) {
        self.send(Command::Connectivity(available)).await;
    }

    /// Queue a one-shot operation and wait for its result. Dropping the
    /// returned future abandons the wait, not the queued job.
    pub async fn run_ad_hoc(&self, operation: Operation) -> Result<PassReport> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::AdHoc(operation, reply_tx))
            .await
            .is_err()
        {
            return Err(SyncError::ServiceUnavailable);
        }
        reply_rx.await.unwrap_or(Err(SyncError::ServiceUnavailable))
    }

    /// Cancel timers, let the in-flight job finish, then exit.
    pub async fn stop(self) {
        self.send(Command::Stop).await;
        if let Err(e) = self.task.await {
            tracing::error!("Scheduler worker ended abnormally: {}", e);
        }
    }

    async fn send(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).await.is_err() {
            tracing::debug!("Scheduler worker is gone, trigger dropped");
        }
    }
}

struct Worker {
    executor: Arc<dyn Executor>,
    connectivity: Arc<ConnectivityMonitor>,
    config: SchedulerConfig,
    events: broadcast::Sender<OperationEvent>,
    pending_user: Option<SyncScope>,
    pending_connectivity: bool,
    pending_periodic: bool,
    ad_hoc: VecDeque<(Operation, oneshot::Sender<Result<PassReport>>)>,
    periodic_at: Option<Instant>,
    connectivity_at: Option<Instant>,
    stopping: bool,
}

impl Worker {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let executor = Arc::clone(&self.executor);
        let mut running: Option<Running<'_>> = None;

        loop {
            if running.is_none() {
                if self.stopping {
                    break;
                }
                if let Some(job) = self.next_job() {
                    tracing::debug!("Running {} ({:?})", job.operation, job.trigger);
                    let future = executor.execute(job.operation.clone());
                    running = Some(Running { job, future });
                }
            }

            let periodic_at = self.periodic_at;
            let connectivity_at = self.connectivity_at;

            tokio::select! {
                outcome = wait_running(&mut running), if running.is_some() => {
                    if let Some(done) = running.take() {
                        self.finish(done.job, outcome);
                    }
                }
                cmd = cmd_rx.recv(), if !self.stopping => match cmd {
                    Some(Command::Stop) | None => self.stop(),
                    Some(cmd) => self.accept(cmd),
                },
                _ = sleep_until(periodic_at), if periodic_at.is_some() => {
                    tracing::debug!("Periodic tick");
                    self.periodic_at = None;
                    self.pending_periodic = true;
                }
                _ = sleep_until(connectivity_at), if connectivity_at.is_some() => {
                    self.connectivity_at = None;
                    self.pending_connectivity = self.connectivity.pending_epoch().is_some();
                }
            }
        }

        let dropped = self.pending_user.is_some() as usize
            + self.pending_connectivity as usize
            + self.ad_hoc.len();
        if dropped > 0 {
            tracing::info!("Scheduler stopped with {} queued jobs dropped", dropped);
        } else {
            tracing::debug!("Scheduler stopped");
        }
    }

    fn accept(&mut self, cmd: Command) {
        match cmd {
            Command::UserActivity(scope) => {
                self.pending_user = Some(match self.pending_user.take() {
                    Some(pending) => pending.merge(scope),
                    None => scope,
                });
                // A user-triggered pass supersedes a waiting tick.
                self.pending_periodic = false;
            }
            Command::Connectivity(available) => {
                self.connectivity.update(available);
                if self.connectivity.pending_epoch().is_some() {
                    self.connectivity_at = Some(Instant::now() + self.config.connectivity_debounce);
                } else {
                    self.connectivity_at = None;
                }
            }
            Command::AdHoc(operation, reply) => self.ad_hoc.push_back((operation, reply)),
            Command::Stop => self.stop(),
        }
    }

    fn stop(&mut self) {
        tracing::debug!("Scheduler stopping");
        self.stopping = true;
        self.periodic_at = None;
        self.connectivity_at = None;
        self.pending_periodic = false;
    }

    fn next_job(&mut self) -> Option<Job> {
        if let Some(scope) = self.pending_user.take() {
            return Some(Job {
                trigger: TriggerKind::UserActivity,
                operation: Operation::Sync(scope),
                epoch: None,
                reply: None,
            });
        }
        // Signals seen while the epoch's sync was running are no-ops once it succeeded.
        if std::mem::take(&mut self.pending_connectivity)
            && let Some(epoch) = self.connectivity.pending_epoch()
        {
            return Some(Job {
                trigger: TriggerKind::Connectivity,
                operation: Operation::Sync(SyncScope::All),
                epoch: Some(epoch),
                reply: None,
            });
        }
        if std::mem::take(&mut self.pending_periodic) {
            return Some(Job {
                trigger: TriggerKind::Periodic,
                operation: Operation::Sync(SyncScope::All),
                epoch: None,
                reply: None,
            });
        }
        self.ad_hoc.pop_front().map(|(operation, reply)| Job {
            trigger: TriggerKind::AdHoc,
            operation,
            epoch: None,
            reply: Some(reply),
        })
    }

    fn finish(&mut self, job: Job, outcome: Result<PassReport>) {
        match &outcome {
            Ok(report) => tracing::debug!("{} ({:?}) done: {}", job.operation, job.trigger, report),
            Err(e) => tracing::error!("{} ({:?}) failed: {}", job.operation, job.trigger, e),
        }

        if let Some(epoch) = job.epoch
            && outcome.is_ok()
        {
            self.connectivity.mark_satisfied(epoch);
        }

        let event = OperationEvent {
            trigger: job.trigger,
            operation: job.operation,
            outcome: outcome.as_ref().map(|r| *r).map_err(|e| e.to_string()),
        };

        if let Some(reply) = job.reply {
            // The caller may have given up waiting.
            let _ = reply.send(outcome);
        }
        // No receivers is fine.
        let _ = self.events.send(event);

        if !self.stopping
            && let Some(interval) = self.config.periodic_interval
        {
            self.periodic_at = Some(Instant::now() + interval);
        }
    }
}

async fn wait_running(running: &mut Option<Running<'_>>) -> Result<PassReport> {
    match running {
        Some(running) => (&mut running.future).await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
