//! Document broker task.
//!
//! One Tokio task per open document. The task owns the bound worker and a
//! [`DocumentBroker`] state machine. It takes commands from a bounded queue
//! one at a time, runs the worker round trips the state machine asks for
//! under deadlines, and feeds the outcomes back. No other task ever talks to
//! the worker, which is what keeps edits in one total order.
//!
//! Callers talk to the task through a cloneable [`BrokerHandle`]. Replies
//! travel on oneshot channels; a caller that gives up only drops its
//! receiver, the broker still finishes the work.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    time::Duration,
};

use bytes::Bytes;
use cowrite_core::{
    BrokerAction, BrokerError, BrokerId, BrokerState, CounterGuard, DocumentBroker, DocumentId,
    EditAck, Environment, LogLevel, ServiceContext, SessionEvent, SessionId, Worker, WorkerError,
};
use tokio::sync::{mpsc, oneshot, watch};

use crate::supervisor::{WorkerDeath, WorkerLease};

type AdmitReply = oneshot::Sender<Result<(), BrokerError>>;
type EditReply = oneshot::Sender<Result<EditAck, BrokerError>>;

/// Hands the worker back to the supervisor once the broker is done.
pub type ReleaseFn<W> = Box<dyn FnOnce(W) + Send>;

/// Removes the broker from the registry.
pub type CloseFn = Box<dyn FnOnce(&DocumentId, BrokerId) + Send>;

/// What the task does with its worker and its registry slot when it ends.
pub struct Teardown<W> {
    /// Called exactly once with the worker after the task loop exits
    pub release: ReleaseFn<W>,
    /// Called exactly once when the broker reaches a terminal state
    pub close: CloseFn,
}

#[derive(Debug)]
pub(crate) enum BrokerCommand {
    Admit {
        session: SessionId,
        outbound: mpsc::UnboundedSender<SessionEvent>,
        reply: AdmitReply,
    },
    Edit {
        session: SessionId,
        payload: Bytes,
        reply: EditReply,
    },
    Remove {
        session: SessionId,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
}

/// Cloneable handle to a running broker task.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    id: BrokerId,
    document: DocumentId,
    pid: u32,
    commands: mpsc::Sender<BrokerCommand>,
    state: watch::Receiver<BrokerState>,
}

impl BrokerHandle {
    /// Broker generation id.
    pub fn id(&self) -> BrokerId {
        self.id
    }

    /// Document served.
    pub fn document(&self) -> &DocumentId {
        &self.document
    }

    /// Process id of the bound worker.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Last state published by the task.
    pub fn state(&self) -> BrokerState {
        *self.state.borrow()
    }

    /// Whether new sessions may still join.
    pub fn is_open(&self) -> bool {
        self.state().accepts_sessions() && !self.commands.is_closed()
    }

    /// Admit `session`; events for it arrive on `outbound`.
    ///
    /// Resolves once the worker has confirmed the join, so the join state is
    /// already queued on `outbound`.
    ///
    /// # Errors
    ///
    /// - `BrokerClosing` if the broker is unloading or gone.
    /// - The broker's failure if it failed before the join completed.
    pub async fn admit(
        &self,
        session: SessionId,
        outbound: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<(), BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(BrokerCommand::Admit { session, outbound, reply })
            .await
            .map_err(|_| BrokerError::BrokerClosing(self.document.clone()))?;
        rx.await.map_err(|_| BrokerError::BrokerClosing(self.document.clone()))?
    }

    /// Sequence an edit from `session` and wait for the worker's reply.
    pub async fn dispatch_edit(
        &self,
        session: SessionId,
        payload: Bytes,
    ) -> Result<EditAck, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(BrokerCommand::Edit { session, payload, reply })
            .await
            .map_err(|_| self.gone("edit"))?;
        rx.await.map_err(|_| self.gone("edit"))?
    }

    /// Remove `session`. Returns before the worker has seen the leave.
    pub async fn remove_session(&self, session: SessionId) -> Result<(), BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(BrokerCommand::Remove { session, reply })
            .await
            .map_err(|_| self.gone("remove session"))?;
        rx.await.map_err(|_| self.gone("remove session"))?
    }

    fn gone(&self, operation: &'static str) -> BrokerError {
        BrokerError::InvalidState { state: self.state(), operation }
    }

    /// Handle wired to bare channels instead of a task.
    #[cfg(test)]
    pub(crate) fn detached(
        id: u64,
        document: DocumentId,
    ) -> (Self, watch::Sender<BrokerState>, mpsc::Receiver<BrokerCommand>) {
        let (commands, rx) = mpsc::channel(1);
        let (state_tx, state) = watch::channel(BrokerState::Active);
        let handle = Self { id: BrokerId::from_raw(id), document, pid: 0, commands, state };
        (handle, state_tx, rx)
    }
}

/// Start the task for `document` on the leased worker.
pub fn spawn_broker<W: Worker, E: Environment>(
    ctx: &ServiceContext,
    env: E,
    document: DocumentId,
    lease: WorkerLease<W>,
    teardown: Teardown<W>,
) -> BrokerHandle {
    let config = ctx.config();
    let id = ctx.next_broker_id();
    let pid = lease.worker.pid();

    let (commands, rx) = mpsc::channel(config.broker_queue_depth);
    let (state_tx, state) = watch::channel(BrokerState::Loading);

    let task = BrokerTask {
        broker: DocumentBroker::new(id, document.clone(), config.echo_policy),
        env,
        pid,
        deadlines: Deadlines {
            load: config.load_timeout,
            round_trip: config.round_trip_timeout,
            flush: config.flush_timeout,
        },
        death: Some(lease.death),
        outbound: HashMap::new(),
        admissions: HashMap::new(),
        pending_edit: None,
        state: state_tx,
        close: Some(teardown.close),
        released: false,
        _counted: ctx.accounting().broker_opened(),
    };
    tokio::spawn(run(task, lease.worker, rx, teardown.release));

    BrokerHandle { id, document, pid, commands, state }
}

#[derive(Debug, Clone, Copy)]
struct Deadlines {
    load: Duration,
    round_trip: Duration,
    flush: Duration,
}

struct BrokerTask<E: Environment> {
    broker: DocumentBroker<E::Instant>,
    env: E,
    pid: u32,
    deadlines: Deadlines,
    death: Option<oneshot::Receiver<WorkerDeath>>,
    outbound: HashMap<SessionId, mpsc::UnboundedSender<SessionEvent>>,
    admissions: HashMap<SessionId, AdmitReply>,
    pending_edit: Option<EditReply>,
    state: watch::Sender<BrokerState>,
    close: Option<CloseFn>,
    released: bool,
    /// Decrements the live broker count when the task ends
    _counted: CounterGuard,
}

async fn run<W: Worker, E: Environment>(
    mut task: BrokerTask<E>,
    mut worker: W,
    mut commands: mpsc::Receiver<BrokerCommand>,
    release: ReleaseFn<W>,
) {
    let broker = task.broker.id();
    let document = task.broker.document().clone();
    tracing::debug!(%broker, %document, pid = task.pid, "broker started");

    let loaded = task.load(&mut worker, &mut commands).await;
    task.execute(&mut worker, loaded).await;

    while !task.broker.state().is_terminal() {
        tokio::select! {
            death = worker_death(&mut task.death) => {
                let actions = task.broker.on_worker_failure(BrokerError::WorkerDied { pid: death.pid });
                task.execute(&mut worker, actions).await;
            },
            command = commands.recv() => {
                let Some(command) = command else {
                    tracing::warn!(%broker, %document, "all handles dropped; abandoning broker");
                    break;
                };
                let actions = task.on_command(command);
                task.execute(&mut worker, actions).await;
            },
        }
    }

    commands.close();
    while let Ok(command) = commands.try_recv() {
        task.turn_away(command);
    }

    if !task.released {
        tracing::debug!(%broker, %document, "releasing worker of abandoned broker");
    }
    release(worker);
    tracing::debug!(%broker, %document, state = ?task.broker.state(), "broker stopped");
}

impl<E: Environment> BrokerTask<E> {
    /// Run the load round trip while still taking commands.
    ///
    /// Sessions admitted meanwhile wait inside the state machine; whatever
    /// the commands produce runs once the load has resolved.
    async fn load<W: Worker>(
        &mut self,
        worker: &mut W,
        commands: &mut mpsc::Receiver<BrokerCommand>,
    ) -> Vec<BrokerAction> {
        let document = self.broker.document().clone();
        let bind = round_trip(self.pid, "load", self.deadlines.load, worker.bind(&document));
        tokio::pin!(bind);

        let mut actions = Vec::new();
        loop {
            tokio::select! {
                outcome = &mut bind => {
                    // Opens already queued wait for this load with the rest.
                    while let Ok(command) = commands.try_recv() {
                        actions.extend(self.on_command(command));
                    }
                    actions.extend(match outcome {
                        Ok(outcome) => self.broker.on_loaded(outcome),
                        Err(err) => self.broker.on_worker_failure(err),
                    });
                    return actions;
                },
                death = worker_death(&mut self.death) => {
                    actions.extend(
                        self.broker.on_worker_failure(BrokerError::WorkerDied { pid: death.pid }),
                    );
                    return actions;
                },
                Some(command) = commands.recv() => actions.extend(self.on_command(command)),
            }
        }
    }

    /// Apply one command to the state machine. Errors are answered here.
    fn on_command(&mut self, command: BrokerCommand) -> Vec<BrokerAction> {
        match command {
            BrokerCommand::Admit { session, outbound, reply } => {
                match self.broker.admit_session(session, self.env.now()) {
                    Ok(actions) => {
                        self.outbound.insert(session, outbound);
                        self.admissions.insert(session, reply);
                        actions
                    },
                    Err(err) => {
                        let _ = reply.send(Err(err));
                        Vec::new()
                    },
                }
            },
            BrokerCommand::Edit { session, payload, reply } => {
                match self.broker.dispatch_edit(session, payload) {
                    Ok(actions) => {
                        self.pending_edit = Some(reply);
                        actions
                    },
                    Err(err) => {
                        let _ = reply.send(Err(err));
                        Vec::new()
                    },
                }
            },
            BrokerCommand::Remove { session, reply } => match self.broker.remove_session(session) {
                Ok(actions) => {
                    self.outbound.remove(&session);
                    self.admissions.remove(&session);
                    let _ = reply.send(Ok(()));
                    actions
                },
                Err(err) => {
                    let _ = reply.send(Err(err));
                    Vec::new()
                },
            },
        }
    }

    /// Answer a command still queued when the broker stopped.
    ///
    /// Opens get `BrokerClosing` so the caller moves on to a fresh broker.
    fn turn_away(&self, command: BrokerCommand) {
        match command {
            BrokerCommand::Admit { reply, .. } => {
                let _ = reply.send(Err(BrokerError::BrokerClosing(self.broker.document().clone())));
            },
            BrokerCommand::Edit { reply, .. } => {
                let _ = reply.send(Err(self.stopped("edit")));
            },
            BrokerCommand::Remove { reply, .. } => {
                let _ = reply.send(Err(self.stopped("remove session")));
            },
        }
    }

    fn stopped(&self, operation: &'static str) -> BrokerError {
        self.broker
            .failure()
            .cloned()
            .unwrap_or(BrokerError::InvalidState { state: self.broker.state(), operation })
    }

    /// Execute `actions` in order.
    ///
    /// Follow-ups of an action run before its siblings, so an edit's
    /// broadcasts go out before the next queued action. A failed round trip
    /// drops everything still queued and runs the failure path instead.
    async fn execute<W: Worker>(&mut self, worker: &mut W, actions: Vec<BrokerAction>) {
        let mut queue = VecDeque::from(actions);

        while let Some(action) = queue.pop_front() {
            let follow_up = match self.step(worker, action).await {
                Ok(actions) => actions,
                Err(error) => {
                    queue.clear();
                    if let Some(pending) = self.pending_edit.take() {
                        let _ = pending.send(Err(error.clone()));
                    }
                    self.broker.on_worker_failure(error)
                },
            };

            for action in follow_up.into_iter().rev() {
                queue.push_front(action);
            }
            self.state.send_replace(self.broker.state());
        }
    }

    async fn step<W: Worker>(
        &mut self,
        worker: &mut W,
        action: BrokerAction,
    ) -> Result<Vec<BrokerAction>, BrokerError> {
        let pid = self.pid;
        let deadline = self.deadlines.round_trip;

        let follow_up = match action {
            BrokerAction::JoinWorker { session } => {
                let reply = round_trip(pid, "join", deadline, worker.join(session)).await?;
                self.broker.on_joined(session, reply)
            },
            BrokerAction::LeaveWorker { session } => {
                round_trip(pid, "leave", deadline, worker.leave(session)).await?;
                Vec::new()
            },
            BrokerAction::ForwardEdit { session, edit_seq, payload } => {
                let reply = round_trip(pid, "edit", deadline, worker.send(session, payload)).await?;
                let (ack, broadcasts) = self.broker.on_edit_applied(session, edit_seq, reply);
                if let Some(pending) = self.pending_edit.take() {
                    let _ = pending.send(Ok(ack));
                }
                broadcasts
            },
            BrokerAction::FlushWorker => {
                round_trip(pid, "flush", self.deadlines.flush, worker.flush()).await?;
                self.broker.on_flushed()
            },
            BrokerAction::Deliver { session, event } => {
                self.deliver(session, event);
                Vec::new()
            },
            BrokerAction::Admitted { session } => self.admitted(session),
            BrokerAction::Rejected { session, error } => {
                self.outbound.remove(&session);
                if let Some(reply) = self.admissions.remove(&session) {
                    let _ = reply.send(Err(error));
                }
                Vec::new()
            },
            BrokerAction::ReleaseWorker => {
                self.released = true;
                Vec::new()
            },
            BrokerAction::CloseRegistry => {
                if let Some(close) = self.close.take() {
                    close(self.broker.document(), self.broker.id());
                }
                Vec::new()
            },
            BrokerAction::Log { level, message } => {
                self.log(level, &message);
                Vec::new()
            },
        };
        Ok(follow_up)
    }

    fn deliver(&mut self, session: SessionId, event: SessionEvent) {
        let last = matches!(event, SessionEvent::Failed { .. });
        if let Some(outbound) = self.outbound.get(&session) {
            if outbound.send(event).is_err() {
                tracing::debug!(session = %session, "session stopped listening");
            }
        }
        if last {
            self.outbound.remove(&session);
        }
    }

    fn admitted(&mut self, session: SessionId) -> Vec<BrokerAction> {
        let Some(reply) = self.admissions.remove(&session) else {
            return Vec::new();
        };
        if reply.send(Ok(())).is_ok() {
            return Vec::new();
        }

        // The opener gave up before the join finished.
        tracing::debug!(session = %session, "opener went away; removing session");
        self.outbound.remove(&session);
        self.broker.remove_session(session).unwrap_or_default()
    }

    fn log(&self, level: LogLevel, message: &str) {
        let broker = self.broker.id();
        let document = self.broker.document();
        match level {
            LogLevel::Debug => tracing::debug!(%broker, %document, "{message}"),
            LogLevel::Info => tracing::info!(%broker, %document, "{message}"),
            LogLevel::Warn => tracing::warn!(%broker, %document, "{message}"),
            LogLevel::Error => tracing::error!(%broker, %document, "{message}"),
        }
    }
}

/// Run one worker round trip under `deadline`.
async fn round_trip<T>(
    pid: u32,
    operation: &'static str,
    deadline: Duration,
    request: impl Future<Output = Result<T, WorkerError>>,
) -> Result<T, BrokerError> {
    tokio::time::timeout(deadline, request)
        .await
        .map_err(|_| BrokerError::WorkerTimeout { pid, operation, deadline })?
        .map_err(BrokerError::from)
}

/// Resolves when the supervisor reports the worker dead. Pends forever once
/// the report channel is gone, so a dropped sender is not mistaken for death.
async fn worker_death(slot: &mut Option<oneshot::Receiver<WorkerDeath>>) -> WorkerDeath {
    if let Some(rx) = slot.as_mut() {
        let received = rx.await;
        *slot = None;
        if let Ok(death) = received {
            return death;
        }
    }
    std::future::pending().await
}
