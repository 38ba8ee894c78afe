//! Top-level CMS service: owns the store, the IMAP session and the scheduler.
//!
//! Foreground callers never touch the network. Local actions update the store
//! and enqueue a user-activity trigger; all protocol work runs on the
//! scheduler's worker through [`CmsExecutor`].

use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use tokio::sync::broadcast;

use crate::clock::SharedClock;
use crate::codec::CmsMessage;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::imap::{ImapConnection, SessionManager};
use crate::scheduler::{
    ConnectivityMonitor, Executor, Operation, OperationEvent, Scheduler, SchedulerConfig,
};
use crate::store::LocalStore;
use crate::sync::model::{SyncScope, contact_folder};
use crate::sync::{PassReport, Reconciler};

/// Used for local folder names until the server reports its separator.
const FALLBACK_SEPARATOR: &str = "/";

/// Runs scheduler operations against the shared session.
pub struct CmsExecutor {
    store: Arc<LocalStore>,
    sessions: SessionManager,
    settings: SyncConfig,
    clock: SharedClock,
    separator: OnceLock<String>,
}

impl CmsExecutor {
    pub fn new(
        store: Arc<LocalStore>,
        sessions: SessionManager,
        settings: SyncConfig,
        clock: SharedClock,
    ) -> Self {
        let separator = OnceLock::new();
        if let Some(configured) = &settings.separator {
            let _ = separator.set(configured.clone());
        }
        Self {
            store,
            sessions,
            settings,
            clock,
            separator,
        }
    }

    /// Configured or discovered separator, if known.
    pub fn separator(&self) -> Option<&str> {
        self.separator.get().map(String::as_str)
    }

    async fn discover_separator(&self, conn: &mut ImapConnection) -> Result<String> {
        if let Some(separator) = self.separator.get() {
            return Ok(separator.clone());
        }

        let root = conn.list("").await?;
        let separator = root
            .into_iter()
            .find_map(|entry| entry.delimiter)
            .unwrap_or_else(|| FALLBACK_SEPARATOR.to_string());
        tracing::info!("Server hierarchy separator is '{}'", separator);
        Ok(self.separator.get_or_init(|| separator).clone())
    }

    /// Run one operation. Fails fast with `ServiceUnavailable` while another
    /// holder has the session.
    pub async fn run(&self, operation: &Operation) -> Result<PassReport> {
        let mut session = self.sessions.acquire().await?;
        let conn = session.connection()?;
        let result = self.run_on(conn, operation).await;

        if let Err(e) = &result
            && e.poisons_connection()
        {
            tracing::warn!("Dropping IMAP connection after error: {}", e);
            session.invalidate();
        }
        result
    }

    async fn run_on(&self, conn: &mut ImapConnection, operation: &Operation) -> Result<PassReport> {
        let separator = self.discover_separator(conn).await?;
        let reconciler = Reconciler::new(&self.store, &self.settings, &separator, self.clock.as_ref());

        match operation {
            Operation::Sync(scope) => reconciler.run(conn, scope).await,
            Operation::Push => reconciler.push_pending(conn).await,
            Operation::Wipe => {
                tracing::info!("Wiping local store before full resync");
                self.store.wipe().await?;
                reconciler.run(conn, &SyncScope::All).await
            }
        }
    }

    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }
}

impl Executor for CmsExecutor {
    fn execute(&self, operation: Operation) -> BoxFuture<'_, Result<PassReport>> {
        Box::pin(async move { self.run(&operation).await })
    }
}

pub struct CmsService {
    executor: Arc<CmsExecutor>,
    connectivity: Arc<ConnectivityMonitor>,
    scheduler_config: SchedulerConfig,
    scheduler: Option<Scheduler>,
}

impl CmsService {
    pub fn new(executor: CmsExecutor) -> Self {
        let scheduler_config = SchedulerConfig {
            periodic_interval: Some(executor.settings.periodic_interval()),
            connectivity_debounce: executor.settings.connectivity_debounce(),
        };
        Self {
            executor: Arc::new(executor),
            connectivity: Arc::new(ConnectivityMonitor::new()),
            scheduler_config,
            scheduler: None,
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.executor.store
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_some()
    }

    /// Start background sync. A no-op when already running.
    pub fn start(&mut self) {
        if self.scheduler.is_some() {
            return;
        }
        let executor: Arc<dyn Executor> = self.executor.clone();
        self.scheduler = Some(Scheduler::start(
            executor,
            Arc::clone(&self.connectivity),
            self.scheduler_config.clone(),
        ));
        tracing::info!("CMS service started");
    }

    /// Stop background sync and log out.
    pub async fn stop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.stop().await;
        }
        self.executor.shutdown().await;
        tracing::info!("CMS service stopped");
    }

    /// Observe completed operations. `None` while stopped.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<OperationEvent>> {
        self.scheduler.as_ref().map(Scheduler::subscribe)
    }

    /// Run an operation directly, bypassing the scheduler.
    pub async fn run_once(&self, operation: Operation) -> Result<PassReport> {
        self.executor.run(&operation).await
    }

    /// Ask for a sync now; queued behind the running job if any.
    pub async fn sync(&self, scope: SyncScope) {
        match &self.scheduler {
            Some(scheduler) => scheduler.user_activity(scope).await,
            None => tracing::debug!("Sync of {} requested while stopped", scope),
        }
    }

    pub async fn connectivity_changed(&self, available: bool) {
        match &self.scheduler {
            Some(scheduler) => scheduler.connectivity_changed(available).await,
            None => {
                self.connectivity.update(available);
            }
        }
    }

    /// Wipe and resync, behind whatever is running.
    pub async fn wipe(&self) -> Result<PassReport> {
        match &self.scheduler {
            Some(scheduler) => scheduler.run_ad_hoc(Operation::Wipe).await,
            None => self.run_once(Operation::Wipe).await,
        }
    }

    /// Local "mark read"; pushed on the next pass.
    pub async fn mark_read(&self, base_id: &str) -> Result<bool> {
        let changed = self.store().mark_read(base_id).await?;
        if changed {
            self.request_push(base_id).await?;
        }
        Ok(changed)
    }

    /// Local "delete"; pushed as `\Deleted` on the next pass.
    pub async fn delete(&self, base_id: &str) -> Result<bool> {
        let changed = self.store().mark_deleted(base_id).await?;
        if changed {
            self.request_push(base_id).await?;
        }
        Ok(changed)
    }

    /// Store an outgoing message and request its push to the contact's folder.
    pub async fn send(&self, message: &CmsMessage) -> Result<String> {
        let folder = self.folder_for(message.envelope().contact());
        let base_id = self.store().request_send(&folder, message).await?;
        tracing::debug!("Queued {} for '{}'", base_id, folder);
        self.sync(SyncScope::Folder(folder)).await;
        Ok(base_id)
    }

    fn folder_for(&self, contact: &str) -> String {
        let separator = self.executor.separator().unwrap_or(FALLBACK_SEPARATOR);
        contact_folder(&self.executor.settings.root_folder, separator, contact)
    }

    async fn request_push(&self, base_id: &str) -> Result<()> {
        if let Some(mapping) = self.store().mapping(base_id).await? {
            self.sync(SyncScope::Folder(mapping.folder)).await;
        }
        Ok(())
    }
}
