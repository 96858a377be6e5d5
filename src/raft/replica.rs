//! Replica state and the apply-thread actor.
//!
//! One replica owns its log, metadata store and state machine, and mutates
//! them only from a single task. Inbound requests are marshalled onto that
//! task through `ReplicaHandle`; responses travel back over oneshot
//! channels. Fatal storage errors terminate the task and abort the
//! process.

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::{RaftError, Result};
use crate::metrics;
use crate::raft::entry::Configuration;
use crate::raft::follower;
use crate::raft::log::RaftLog;
use crate::raft::message::{
    PingRequest, PingResponse, PollRequest, PollResponse, SubmitRequest, SubmitResponse,
    SyncRequest, SyncResponse,
};
use crate::raft::meta::MetaStore;
use crate::raft::StateMachine;

const MAILBOX_SIZE: usize = 1024;
const EVENT_BUS_SIZE: usize = 64;

/// Replica roles. Inbound request handling is shared by all of them; only
/// the leader additionally accepts submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Notifications published on the replica event bus.
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    TermChanged { term: u64 },
    LeaderFound { term: u64, leader: String },
    VoteCast { term: u64, candidate: String },
    RoleChanged { role: Role },
}

/// The in-memory state of one replica.
///
/// Setters for the term and the vote persist through the metadata store
/// before returning, so a response that depends on them is never sent
/// ahead of the flush.
pub struct ReplicaContext {
    local_id: String,
    current_term: u64,
    current_leader: Option<String>,
    last_voted_for: Option<String>,
    commit_index: u64,
    last_applied: u64,
    max_log_size: u64,
    cluster: Configuration,
    meta: MetaStore,
    pub log: Box<dyn RaftLog>,
    pub state_machine: Box<dyn StateMachine>,
    events: broadcast::Sender<ReplicaEvent>,
}

impl ReplicaContext {
    /// Builds a context, reloading term, vote and configuration from the
    /// metadata store.
    pub fn new(
        local_id: String,
        cluster: Configuration,
        mut meta: MetaStore,
        log: Box<dyn RaftLog>,
        state_machine: Box<dyn StateMachine>,
        max_log_size: u64,
    ) -> Result<ReplicaContext> {
        let current_term = meta.load_term()?;
        let last_voted_for = meta.load_vote()?;
        let cluster = match meta.load_configuration()? {
            Some(stored) => stored,
            None => {
                meta.store_configuration(&cluster)?;
                cluster
            }
        };
        let (events, _) = broadcast::channel(EVENT_BUS_SIZE);

        metrics::CURRENT_TERM.set(current_term as i64);

        Ok(ReplicaContext {
            local_id,
            current_term,
            current_leader: None,
            last_voted_for,
            commit_index: 0,
            last_applied: 0,
            max_log_size,
            cluster,
            meta,
            log,
            state_machine,
            events,
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    /// Adopts a greater term, clearing the recorded vote and the known
    /// leader. Lesser or equal terms are ignored; the term never
    /// decreases.
    pub fn set_current_term(&mut self, term: u64) -> Result<()> {
        if term <= self.current_term {
            return Ok(());
        }
        self.current_term = term;
        self.meta.store_term(term)?;
        self.set_last_voted_for(None)?;
        self.current_leader = None;
        metrics::CURRENT_TERM.set(term as i64);
        self.emit(ReplicaEvent::TermChanged { term });
        Ok(())
    }

    pub fn current_leader(&self) -> Option<&str> {
        self.current_leader.as_deref()
    }

    pub fn set_current_leader(&mut self, leader: Option<String>) {
        if let Some(leader) = &leader {
            if self.current_leader.as_deref() != Some(leader.as_str()) {
                log::info!("learned leader {} for term {}", leader, self.current_term);
                self.emit(ReplicaEvent::LeaderFound {
                    term: self.current_term,
                    leader: leader.clone(),
                });
            }
        }
        self.current_leader = leader;
    }

    pub fn last_voted_for(&self) -> Option<&str> {
        self.last_voted_for.as_deref()
    }

    /// Records (or clears) the vote, persisting before returning.
    pub fn set_last_voted_for(&mut self, vote: Option<String>) -> Result<()> {
        self.meta.store_vote(vote.as_deref())?;
        self.last_voted_for = vote;
        Ok(())
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn set_commit_index(&mut self, index: u64) {
        self.commit_index = index;
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn set_last_applied(&mut self, index: u64) {
        self.last_applied = index;
    }

    pub fn max_log_size(&self) -> u64 {
        self.max_log_size
    }

    pub fn cluster(&self) -> &Configuration {
        &self.cluster
    }

    /// Replaces the cluster view and persists it.
    pub fn set_cluster(&mut self, cluster: Configuration) -> Result<()> {
        self.meta.store_configuration(&cluster)?;
        self.cluster = cluster;
        Ok(())
    }

    pub fn emit(&self, event: ReplicaEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplicaEvent> {
        self.events.subscribe()
    }
}

enum ReplicaRequest {
    Ping(PingRequest, oneshot::Sender<PingResponse>),
    Sync(Box<SyncRequest>, oneshot::Sender<SyncResponse>),
    Poll(PollRequest, oneshot::Sender<PollResponse>),
    Submit(SubmitRequest, oneshot::Sender<SubmitResponse>),
    Close,
}

/// Cloneable outward face of a replica. All methods marshal onto the
/// replica task and fail with `RaftError::Closed` once it is destroyed.
#[derive(Clone)]
pub struct ReplicaHandle {
    mailbox: mpsc::Sender<ReplicaRequest>,
}

impl ReplicaHandle {
    pub async fn ping(&self, request: PingRequest) -> Result<PingResponse> {
        let (reply, response) = oneshot::channel();
        self.mailbox
            .send(ReplicaRequest::Ping(request, reply))
            .await
            .map_err(|_| RaftError::Closed)?;
        response.await.map_err(|_| RaftError::Closed)
    }

    pub async fn sync(&self, request: SyncRequest) -> Result<SyncResponse> {
        let (reply, response) = oneshot::channel();
        self.mailbox
            .send(ReplicaRequest::Sync(Box::new(request), reply))
            .await
            .map_err(|_| RaftError::Closed)?;
        response.await.map_err(|_| RaftError::Closed)
    }

    pub async fn poll(&self, request: PollRequest) -> Result<PollResponse> {
        let (reply, response) = oneshot::channel();
        self.mailbox
            .send(ReplicaRequest::Poll(request, reply))
            .await
            .map_err(|_| RaftError::Closed)?;
        response.await.map_err(|_| RaftError::Closed)
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse> {
        let (reply, response) = oneshot::channel();
        self.mailbox
            .send(ReplicaRequest::Submit(request, reply))
            .await
            .map_err(|_| RaftError::Closed)?;
        response.await.map_err(|_| RaftError::Closed)
    }

    /// Destroys the replica: in-flight requests drain, then the mailbox
    /// closes and further calls fail.
    pub async fn close(&self) {
        let _ = self.mailbox.send(ReplicaRequest::Close).await;
    }
}

/// The replica actor.
pub struct Replica {
    ctx: ReplicaContext,
    role: Role,
    mailbox: mpsc::Receiver<ReplicaRequest>,
}

impl Replica {
    pub fn new(ctx: ReplicaContext) -> (Replica, ReplicaHandle) {
        let (tx, rx) = mpsc::channel(MAILBOX_SIZE);
        (
            Replica {
                ctx,
                role: Role::Follower,
                mailbox: rx,
            },
            ReplicaHandle { mailbox: tx },
        )
    }

    /// Spawns the replica task. A fatal error aborts the process, per the
    /// storage contract.
    pub fn start(ctx: ReplicaContext) -> ReplicaHandle {
        let (replica, handle) = Replica::new(ctx);
        tokio::spawn(async move {
            if let Err(e) = replica.run().await {
                log::error!("replica failed: {}", e);
                std::process::abort();
            }
        });
        handle
    }

    pub fn context(&self) -> &ReplicaContext {
        &self.ctx
    }

    /// Serves requests until the mailbox closes or `Close` arrives.
    pub async fn run(mut self) -> Result<()> {
        log::info!("replica {} open as follower", self.ctx.local_id());
        while let Some(request) = self.mailbox.recv().await {
            match request {
                ReplicaRequest::Ping(request, reply) => {
                    metrics::RPC_COUNTER.with_label_values(&["ping"]).inc();
                    let (response, transition) = follower::ping(&mut self.ctx, &request)?;
                    let _ = reply.send(response);
                    if transition {
                        self.become_follower();
                    }
                }
                ReplicaRequest::Sync(request, reply) => {
                    metrics::RPC_COUNTER.with_label_values(&["sync"]).inc();
                    let (response, transition) = follower::sync(&mut self.ctx, &request)?;
                    let _ = reply.send(response);
                    if transition {
                        self.become_follower();
                    }
                }
                ReplicaRequest::Poll(request, reply) => {
                    metrics::RPC_COUNTER.with_label_values(&["poll"]).inc();
                    let (response, transition) = follower::poll(&mut self.ctx, &request)?;
                    let _ = reply.send(response);
                    if transition {
                        self.become_follower();
                    }
                }
                ReplicaRequest::Submit(request, reply) => {
                    metrics::RPC_COUNTER.with_label_values(&["submit"]).inc();
                    let _ = reply.send(SubmitResponse {
                        id: request.id,
                        index: 0,
                        error: Some(RaftError::NotLeader.to_string()),
                    });
                }
                ReplicaRequest::Close => break,
            }
        }
        log::info!("replica {} destroyed", self.ctx.local_id());
        Ok(())
    }

    // Idempotent when already a follower.
    fn become_follower(&mut self) {
        if self.role != Role::Follower {
            self.role = Role::Follower;
            self.ctx.emit(ReplicaEvent::RoleChanged {
                role: Role::Follower,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::entry::Command;
    use crate::raft::log::MemLog;
    use crate::raft::StorageLevel;
    use tempfile::tempdir;

    struct NullMachine;

    impl StateMachine for NullMachine {
        fn apply_command(&mut self, _index: u64, _command: &Command) {}
        fn snapshot(&self) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        fn install_snapshot(&mut self, _index: u64, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        fn session_expired(&mut self, _session: u64) {}
        fn session_closed(&mut self, _session: u64) {}
    }

    fn test_context(dir: &std::path::Path) -> ReplicaContext {
        let meta = MetaStore::new(dir, "replica", StorageLevel::Memory).unwrap();
        ReplicaContext::new(
            "n1".to_string(),
            Configuration::new(vec!["n1".into(), "n2".into(), "n3".into()]),
            meta,
            Box::new(MemLog::new()),
            Box::new(NullMachine),
            1024,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn handle_round_trips_through_the_actor() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        let (replica, handle) = Replica::new(ctx);
        tokio::spawn(async move {
            replica.run().await.unwrap();
        });

        let response = handle
            .ping(PingRequest {
                id: 1,
                term: 1,
                leader: Some("n2".into()),
                log_index: 0,
                log_term: 0,
            })
            .await
            .unwrap();
        assert_eq!(response.term, 1);
        assert!(response.accepted);

        let response = handle
            .submit(SubmitRequest {
                id: 2,
                session: 1,
                service: "LOCK".into(),
                args: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(response.error.as_deref(), Some("Not the leader"));
    }

    #[tokio::test]
    async fn closed_replica_rejects_requests() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        let (replica, handle) = Replica::new(ctx);
        let task = tokio::spawn(async move { replica.run().await });

        handle.close().await;
        task.await.unwrap().unwrap();

        let err = handle
            .ping(PingRequest {
                id: 1,
                term: 1,
                leader: None,
                log_index: 0,
                log_term: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::Closed));
    }

    #[tokio::test]
    async fn term_adoption_is_visible_on_the_event_bus() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        let mut events = ctx.subscribe();
        let (replica, handle) = Replica::new(ctx);
        tokio::spawn(async move {
            replica.run().await.unwrap();
        });

        handle
            .ping(PingRequest {
                id: 1,
                term: 3,
                leader: Some("n2".into()),
                log_index: 0,
                log_term: 0,
            })
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert!(matches!(event, ReplicaEvent::TermChanged { term: 3 }));
    }
}
