//! # node
//!
//! why: run one consensus participant over a durable log and an injected transport
//! relations: owns state.rs behind a mutex; election.rs, replication.rs, apply.rs and client.rs extend NodeInner
//! what: RaftNode handle and builder, lifecycle, rpc correlation, inbound dispatch, election timer
//!
//! locking: `serial` (tokio) orders inbound requests and local appends that
//! span i/o; `state` (std) is only held for short synchronous sections and
//! never across an await. background work runs on `tasks` and stops when
//! `shutdown` is cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use raft_storage::Log;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::event::{NodeEvent, NodeStatus};
use crate::log::tail_of;
use crate::message::{Envelope, RaftMessage};
use crate::quorum::Quorum;
use crate::state::{NodeState, RaftState};
use crate::state_machine::StateMachine;
use crate::transport::Transport;
use crate::{NodeId, Seq, Term};

const EVENT_CAPACITY: usize = 1024;

/// an outbound request waiting for its reply
struct Pending {
    peer: NodeId,
    reply: oneshot::Sender<RaftMessage>,
}

/// result slot of a client entry, claimed by apply.rs
pub(crate) struct ResultSlot {
    pub term: Term,
    pub reply: oneshot::Sender<Vec<u8>>,
}

pub(crate) struct NodeInner {
    pub config: RaftConfig,
    pub log: Log,
    pub transport: Arc<dyn Transport>,
    pub state_machine: Option<Arc<dyn StateMachine>>,
    pub quorum: Quorum,
    state: StdMutex<RaftState>,
    pub serial: Mutex<()>,
    pending: StdMutex<HashMap<u64, Pending>>,
    next_id: AtomicU64,
    events: broadcast::Sender<NodeEvent>,
    pub commit_tx: watch::Sender<Seq>,
    pub applied_tx: watch::Sender<Seq>,
    /// single-flight guard of the apply loop
    pub apply_lock: Mutex<()>,
    pub results: StdMutex<HashMap<Seq, ResultSlot>>,
    pub shutdown: CancellationToken,
    pub tasks: TaskTracker,
    running: AtomicBool,
}

impl NodeInner {
    pub fn state(&self) -> MutexGuard<'_, RaftState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn results(&self) -> MutexGuard<'_, HashMap<Seq, ResultSlot>> {
        self.results.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> NodeId {
        self.config.id
    }

    pub fn cluster_size(&self) -> usize {
        self.config.nodes.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(RaftError::Closed)
        }
    }

    // -- state and events --

    /// mutate the state, announcing role/term/leader/follower changes
    pub fn update<R>(&self, f: impl FnOnce(&mut RaftState) -> R) -> R {
        let (result, changed) = {
            let mut st = self.state();
            let before = st.shape();
            let result = f(&mut st);
            let changed = (st.shape() != before).then(|| st.status());
            (result, changed)
        };
        if let Some(status) = changed {
            info!(
                node = status.id,
                role = ?status.role,
                term = status.term,
                leader = ?status.leader,
                "state changed"
            );
            self.emit(NodeEvent::Change(status));
        }
        result
    }

    /// become a leaderless follower if `term` is newer than ours
    pub fn step_down(&self, term: Term) {
        self.update(|st| {
            if term > st.term {
                st.become_follower(term, None);
            }
        });
    }

    pub fn emit(&self, event: NodeEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// soft failure: logged and announced, the node keeps going
    pub fn warn(&self, err: RaftError) {
        warn!(node = self.id(), error = %err, "soft failure");
        self.emit(NodeEvent::Warn(Arc::new(err)));
    }

    /// structural failure surfaced through the error event
    pub fn fail(&self, err: RaftError) {
        error!(node = self.id(), error = %err, "node error");
        self.emit(NodeEvent::Error(Arc::new(err)));
    }

    /// reload last index and term from the log head
    pub fn resync_tail(&self) -> Result<()> {
        let (last_index, last_term) = tail_of(self.log.head().as_ref())?;
        self.state().set_tail(last_index, last_term);
        Ok(())
    }

    // -- rpc --

    /// send a request and wait for the reply with the same id
    ///
    /// bounded by `after`; resolves to `Closed` as soon as the node shuts down
    pub async fn rpc(
        &self,
        peer: NodeId,
        message: RaftMessage,
        after: Duration,
        op: &'static str,
    ) -> Result<RaftMessage> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, Pending { peer, reply: tx });
        debug!(node = self.id(), peer, id, kind = message.kind(), "sending");

        let envelope = Envelope::new(id, self.id(), message);
        let exchange = async {
            self.transport.send(peer, envelope).await?;
            rx.await.map_err(|_| RaftError::Closed)
        };
        let result = tokio::select! {
            _ = self.shutdown.cancelled() => Err(RaftError::Closed),
            reply = tokio::time::timeout(after, exchange) => match reply {
                Ok(reply) => reply,
                Err(_) => Err(RaftError::Timeout { op, after }),
            },
        };
        self.pending().remove(&id);
        result
    }

    /// hand a reply to the request waiting on it
    fn resolve(&self, id: u64, from: NodeId, message: RaftMessage) {
        let mut pending = self.pending();
        match pending.remove(&id) {
            Some(waiting) if waiting.peer == from => {
                let _ = waiting.reply.send(message);
            }
            Some(waiting) => {
                debug!(node = self.id(), peer = from, id, "reply from unexpected peer");
                pending.insert(id, waiting);
            }
            None => debug!(node = self.id(), peer = from, id, "late reply dropped"),
        }
    }

    /// answer request `id`; replies of a closed node are dropped
    async fn respond(&self, to: NodeId, id: u64, message: RaftMessage) {
        if !self.is_running() {
            return;
        }
        let envelope = Envelope::new(id, self.id(), message);
        if let Err(e) = self.transport.send(to, envelope).await {
            debug!(node = self.id(), peer = to, error = %e, "reply not sent");
        }
    }

    // -- timers --

    async fn election_timer(self: Arc<Self>) {
        loop {
            let deadline = self.config.election_deadline();
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(deadline) => {}
            }
            let due = {
                let st = self.state();
                st.role != NodeState::Leader && st.last_contact.elapsed() >= deadline
            };
            if due {
                self.run_election();
            }
        }
    }
}

/// A single Raft node in the cluster
///
/// cheap to clone; every clone drives the same node
#[derive(Clone)]
pub struct RaftNode {
    pub(crate) inner: Arc<NodeInner>,
}

/// collects the injected collaborators of a [`RaftNode`]
pub struct RaftNodeBuilder {
    config: RaftConfig,
    log: Log,
    transport: Arc<dyn Transport>,
    state_machine: Option<Arc<dyn StateMachine>>,
    quorum: Quorum,
}

impl RaftNodeBuilder {
    pub fn state_machine(mut self, state_machine: Arc<dyn StateMachine>) -> Self {
        self.state_machine = Some(state_machine);
        self
    }

    pub fn quorum(mut self, quorum: Quorum) -> Self {
        self.quorum = quorum;
        self
    }

    pub fn build(self) -> Result<RaftNode> {
        self.config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = RaftState::new(self.config.id, self.config.group.clone());
        Ok(RaftNode {
            inner: Arc::new(NodeInner {
                config: self.config,
                log: self.log,
                transport: self.transport,
                state_machine: self.state_machine,
                quorum: self.quorum,
                state: StdMutex::new(state),
                serial: Mutex::new(()),
                pending: StdMutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                events,
                commit_tx: watch::Sender::new(-1),
                applied_tx: watch::Sender::new(-1),
                apply_lock: Mutex::new(()),
                results: StdMutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                running: AtomicBool::new(false),
            }),
        })
    }
}

impl RaftNode {
    pub fn builder(config: RaftConfig, log: Log, transport: Arc<dyn Transport>) -> RaftNodeBuilder {
        RaftNodeBuilder {
            config,
            log,
            transport,
            state_machine: None,
            quorum: Quorum::Majority,
        }
    }

    /// node with a majority quorum and no state machine
    pub fn new(config: RaftConfig, log: Log, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::builder(config, log, transport).build()
    }

    pub fn id(&self) -> NodeId {
        self.inner.id()
    }

    pub fn config(&self) -> &RaftConfig {
        &self.inner.config
    }

    pub fn log(&self) -> &Log {
        &self.inner.log
    }

    pub fn status(&self) -> NodeStatus {
        self.inner.state().status()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.state().role == NodeState::Leader
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// open the log, load the tail and start the election timer
    ///
    /// idempotent; a closed node cannot be reopened
    pub async fn open(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(RaftError::Closed);
        }
        let _serial = inner.serial.lock().await;
        if inner.is_running() {
            return Ok(());
        }

        inner.log.open().await?;
        let (last_index, last_term) = tail_of(inner.log.head().as_ref())?;
        let status = inner.update(|st| {
            st.set_tail(last_index, last_term);
            st.term = st.term.max(last_term);
            st.touch();
            st.status()
        });
        inner.running.store(true, Ordering::Release);
        inner.tasks.spawn(inner.clone().election_timer());

        info!(node = status.id, term = status.term, last_index, "node opened");
        inner.emit(NodeEvent::Change(status));
        Ok(())
    }

    /// stop timers and in-flight rpcs, drain apply work, close the log
    ///
    /// idempotent
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        inner.shutdown.cancel();
        inner.tasks.close();
        inner.tasks.wait().await;
        inner.pending().clear();
        {
            let _flight = inner.apply_lock.lock().await;
            inner.results().clear();
        }

        let _serial = inner.serial.lock().await;
        inner.log.close().await?;
        info!(node = inner.id(), "node closed");
        Ok(())
    }

    /// campaign now instead of waiting for the election timer
    pub fn start_election(&self) -> Result<()> {
        self.inner.ensure_running()?;
        self.inner.run_election();
        Ok(())
    }

    /// entry point for every inbound message
    ///
    /// requests are answered through the transport with the same id;
    /// replies complete the matching outstanding rpc. messages arriving
    /// while the node is closed are dropped.
    ///
    /// transports may deliver a node's messages one at a time: this only
    /// waits for local work. forwarded `Propose` and `Read` calls wait on
    /// replies from other nodes, so they run in the background and answer
    /// when they finish.
    pub async fn on_receive(&self, envelope: Envelope) {
        let inner = &self.inner;
        if !inner.is_running() {
            return;
        }
        let Envelope { id, from, message } = envelope;
        debug!(
            node = inner.id(),
            peer = from,
            id,
            kind = message.kind(),
            term = message.term(),
            "received"
        );

        let reply = match message {
            RaftMessage::VoteRequest {
                term,
                prev_term,
                prev_index,
            } => {
                inner
                    .handle_vote_request(from, term, prev_term, prev_index)
                    .await
            }
            RaftMessage::Append {
                term,
                prev_term,
                prev_index,
                commit_index,
                entries,
            } => {
                let request = crate::replication::AppendRequest {
                    term,
                    prev_term,
                    prev_index,
                    commit_index,
                    entries,
                };
                inner.handle_append(from, request).await
            }
            RaftMessage::Propose { term, entries } => {
                let inner = inner.clone();
                self.inner.tasks.spawn(async move {
                    let reply = inner.handle_propose(term, entries).await;
                    inner.respond(from, id, reply).await;
                });
                return;
            }
            RaftMessage::Read { term, cmd } => {
                let inner = inner.clone();
                self.inner.tasks.spawn(async move {
                    let reply = inner.handle_read(term, cmd).await;
                    inner.respond(from, id, reply).await;
                });
                return;
            }
            reply @ (RaftMessage::Vote { .. }
            | RaftMessage::Ack { .. }
            | RaftMessage::Err { .. }) => {
                inner.resolve(id, from, reply);
                return;
            }
        };
        inner.respond(from, id, reply).await;
    }
}

impl std::fmt::Debug for RaftNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftNode")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
