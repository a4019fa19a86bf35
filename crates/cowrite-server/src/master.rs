//! The master facade.
//!
//! Composition root handed to the transport layer. It wires the supervisor,
//! the broker registry and the session table together and exposes the three
//! transport callbacks: open, message and close. Everything else happens on
//! broker and supervisor tasks.

#![allow(clippy::disallowed_types, reason = "Short synchronous critical sections only")]

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use cowrite_core::{
    BrokerError, BrokerId, Diagnostics, DocumentId, EditAck, Environment, ServiceContext,
    SessionEvent, SessionId, WorkerSpawner,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    ServerError,
    broker::{BrokerHandle, Teardown, spawn_broker},
    brokers::BrokerRegistry,
    registry::{ConnectionRegistry, SessionEntry},
    supervisor::WorkerSupervisor,
    system_env::SystemEnv,
};

/// Opens that find the document's broker unloading are retried, in total.
const OPEN_ATTEMPTS: usize = 3;

/// An open session as seen by the transport layer.
#[derive(Debug)]
pub struct SessionHandle {
    /// Session id for later messages and the close
    pub id: SessionId,
    /// Normalized document the session joined
    pub document: DocumentId,
    /// Events for the client, starting with the join snapshot
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Document master: one per process.
pub struct Master<S: WorkerSpawner, E: Environment = SystemEnv> {
    ctx: Arc<ServiceContext>,
    env: E,
    supervisor: Arc<WorkerSupervisor<S, E>>,
    brokers: Arc<BrokerRegistry>,
    sessions: Mutex<ConnectionRegistry<BrokerHandle>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl<S: WorkerSpawner> Master<S, SystemEnv> {
    /// Master on the system clock.
    pub fn new(ctx: Arc<ServiceContext>, spawner: S) -> Self {
        Self::with_env(ctx, spawner, SystemEnv::new())
    }
}

impl<S: WorkerSpawner, E: Environment> Master<S, E> {
    /// Master with an explicit environment.
    pub fn with_env(ctx: Arc<ServiceContext>, spawner: S, env: E) -> Self {
        let supervisor = WorkerSupervisor::new(Arc::clone(&ctx), spawner, env.clone());
        Self {
            ctx,
            env,
            supervisor,
            brokers: Arc::new(BrokerRegistry::new()),
            sessions: Mutex::new(ConnectionRegistry::new()),
            maintenance: Mutex::new(None),
        }
    }

    /// Launch the spawner and start pool maintenance.
    ///
    /// # Errors
    ///
    /// `SpawnerDown` if the spawner could not be launched.
    pub async fn start(&self) -> Result<(), ServerError> {
        self.supervisor.spawn_spawner().await?;

        let mut maintenance = self.maintenance();
        if maintenance.is_none() {
            *maintenance = Some(self.supervisor.start());
        }
        drop(maintenance);

        tracing::info!(
            warm_pool_size = self.ctx.config().warm_pool_size,
            ssl = self.ctx.is_ssl_enabled(),
            "master started"
        );
        Ok(())
    }

    /// Open a session on `document`.
    ///
    /// Joins the document's live broker, or creates one on a fresh worker.
    /// When this returns the join snapshot is already queued on the handle.
    ///
    /// # Errors
    ///
    /// - `InvalidDocumentId` if the id is empty after normalization.
    /// - `SpawnerDown` or `WorkerUnavailable` if no worker could be had.
    /// - The broker's failure if loading or joining failed.
    pub async fn on_session_open(&self, document: &str) -> Result<SessionHandle, BrokerError> {
        let document = DocumentId::new(document)?;
        let session = self.ctx.next_session_id();
        let connection = self.ctx.next_connection_id();
        let counted = self.ctx.accounting().connection_opened();
        let (outbound, events) = mpsc::unbounded_channel();

        for _ in 0..OPEN_ATTEMPTS {
            let joined = async {
                let broker = self
                    .brokers
                    .open_or_join(&document, || self.create_broker(document.clone()))
                    .await?;
                broker.admit(session, outbound.clone()).await?;
                Ok::<_, BrokerError>(broker)
            }
            .await;

            match joined {
                Ok(broker) => {
                    tracing::info!(%session, %document, broker = %broker.id(), "session opened");
                    let entry = SessionEntry::new(document.clone(), broker, connection, counted);
                    self.sessions().register(session, entry);
                    return Ok(SessionHandle { id: session, document, events });
                },
                Err(BrokerError::BrokerClosing(_)) => {
                    tracing::debug!(%session, %document, "broker closing; retrying open");
                },
                Err(err) => {
                    tracing::warn!(%session, %document, error = %err, "session open failed");
                    return Err(err);
                },
            }
        }

        Err(BrokerError::BrokerClosing(document))
    }

    async fn create_broker(&self, document: DocumentId) -> Result<BrokerHandle, BrokerError> {
        let lease = self.supervisor.request_worker(&document).await?;

        let supervisor = Arc::clone(&self.supervisor);
        let brokers = Arc::clone(&self.brokers);
        let teardown = Teardown {
            release: Box::new(move |worker: S::Worker| {
                tokio::spawn(async move { supervisor.release_worker(worker).await });
            }),
            close: Box::new(move |document: &DocumentId, broker: BrokerId| {
                brokers.close_if_empty(document, broker);
            }),
        };

        Ok(spawn_broker(&self.ctx, self.env.clone(), document, lease, teardown))
    }

    /// Forward an edit from `session` to its document.
    ///
    /// # Errors
    ///
    /// - `SessionNotFound` if the session is not open.
    /// - `WorkerTimeout`, `WorkerDied` or `Transport` if the worker failed
    ///   while handling the edit; the broker has failed with it.
    pub async fn on_session_message(
        &self,
        session: SessionId,
        payload: Bytes,
    ) -> Result<EditAck, BrokerError> {
        let broker = self
            .sessions()
            .get(session)
            .map(|entry| entry.broker.clone())
            .ok_or(BrokerError::SessionNotFound(session))?;

        broker.dispatch_edit(session, payload).await
    }

    /// Close `session`. The last session out unloads the document.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` if the session is not open.
    pub async fn on_session_close(&self, session: SessionId) -> Result<(), BrokerError> {
        let entry =
            self.sessions().unregister(session).ok_or(BrokerError::SessionNotFound(session))?;

        // A failed broker has already dropped the session.
        if let Err(err) = entry.broker.remove_session(session).await {
            tracing::debug!(
                %session,
                document = %entry.document,
                error = %err,
                "broker gone at close"
            );
        }
        tracing::info!(%session, document = %entry.document, "session closed");
        Ok(())
    }

    /// Counters and pool figures.
    pub fn diagnostics(&self) -> Diagnostics {
        let accounting = self.ctx.accounting();
        let pool = self.supervisor.stats();
        Diagnostics {
            num_doc_brokers: accounting.num_doc_brokers(),
            num_connections: accounting.num_connections(),
            idle_workers: pool.idle,
            spawns_in_flight: pool.in_flight,
            tracked_workers: pool.tracked,
            spawner_alive: self.supervisor.is_spawner_alive(),
            engine_version: self.ctx.engine_version().map(str::to_owned),
        }
    }

    /// Flips to `true` once the spawner is down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.supervisor.spawner_down_signal()
    }

    /// Stop pool maintenance and wait for the loop to exit.
    pub async fn shutdown(&self) {
        self.supervisor.stop();
        let maintenance = self.maintenance().take();
        if let Some(handle) = maintenance {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "maintenance task ended abnormally");
            }
        }
        tracing::info!("master stopped");
    }

    /// Process-scoped context.
    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }

    /// Worker supervisor.
    pub fn supervisor(&self) -> &WorkerSupervisor<S, E> {
        &self.supervisor
    }

    /// Live brokers by document.
    pub fn brokers(&self) -> &BrokerRegistry {
        &self.brokers
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.sessions().session_count()
    }

    /// Sessions open on `document`.
    pub fn sessions_for_document(&self, document: &DocumentId) -> Vec<SessionId> {
        self.sessions().sessions_for_document(document).collect()
    }

    fn sessions(&self) -> MutexGuard<'_, ConnectionRegistry<BrokerHandle>> {
        #[allow(clippy::expect_used)]
        self.sessions.lock().expect("invariant: session table mutex is never poisoned")
    }

    fn maintenance(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        #[allow(clippy::expect_used)]
        self.maintenance.lock().expect("invariant: maintenance mutex is never poisoned")
    }
}
