#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::HashMap;
use async_trait::async_trait;
use jointraft_raft::msg::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    LogEntry, LogIndex, NodeConfiguration, NodeId, RaftNodeSummary, RequestVoteRequest,
    RequestVoteResponse, SnapshotHeader, Term,
};
use jointraft_raft::{
    Discovery, DiscoveryError, EngineConfig, MemoryStore, Node, NodeHandle, PersistentStore,
    StateMachine, StateMachineError, StorageError, Transport, TransportError,
};
use tokio::time::{sleep, Instant};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn member(id: &str) -> NodeConfiguration {
    NodeConfiguration::new(id, format!("scripted://{id}"))
}

pub fn members(ids: &[&str]) -> Vec<NodeConfiguration> {
    ids.iter().map(|id| member(id)).collect()
}

/// Elections within a few hundred milliseconds.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        election_timeout_min_ms: 150,
        election_timeout_max_ms: 300,
        heartbeat_interval_ms: 30,
        rpc_timeout_ms: 50,
        ..Default::default()
    }
}

/// Leaves a second or more before the node campaigns on its own.
pub fn slow_config() -> EngineConfig {
    EngineConfig {
        election_timeout_min_ms: 1000,
        election_timeout_max_ms: 1500,
        heartbeat_interval_ms: 50,
        rpc_timeout_ms: 50,
        ..Default::default()
    }
}

///////////////////////////////////////////////////
// Scripted peers
///////////////////////////////////////////////////

#[derive(Clone, Debug)]
pub enum AppendBehaviour {
    Accept,
    /// Accepts appends whose entries end at or before the given index; beyond it the peer
    /// reports a log that ends there.
    AcceptUpTo(LogIndex),
    Unreachable,
}

#[derive(Clone, Debug)]
pub struct AppendCall {
    pub peer: NodeId,
    pub request: AppendEntriesRequest,
    pub response: Option<AppendEntriesResponse>,
}

#[derive(Default)]
struct Script {
    grant_votes: HashMap<NodeId, bool>,
    append: HashMap<NodeId, AppendBehaviour>,
    /// One-off conflict replies, consumed before the standing behaviour applies.
    conflicts: HashMap<NodeId, VecDeque<(Option<Term>, LogIndex)>>,
    votes: Vec<(NodeId, RequestVoteRequest)>,
    appends: Vec<AppendCall>,
    snapshots: Vec<(NodeId, InstallSnapshotRequest)>,
}

/// Answers on behalf of every peer without running them.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn grant_votes(&self, peer: &str, grant: bool) {
        self.script
            .lock()
            .unwrap()
            .grant_votes
            .insert(peer.to_string(), grant);
    }

    pub fn set_append(&self, peer: &str, behaviour: AppendBehaviour) {
        self.script
            .lock()
            .unwrap()
            .append
            .insert(peer.to_string(), behaviour);
    }

    pub fn push_conflict(&self, peer: &str, conflicting_term: Option<Term>, first_index: LogIndex) {
        self.script
            .lock()
            .unwrap()
            .conflicts
            .entry(peer.to_string())
            .or_default()
            .push_back((conflicting_term, first_index));
    }

    pub fn appends_to(&self, peer: &str) -> Vec<AppendCall> {
        self.script
            .lock()
            .unwrap()
            .appends
            .iter()
            .filter(|call| call.peer == peer)
            .cloned()
            .collect()
    }

    pub fn snapshots_to(&self, peer: &str) -> Vec<InstallSnapshotRequest> {
        self.script
            .lock()
            .unwrap()
            .snapshots
            .iter()
            .filter(|(p, _)| p == peer)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn vote_requests(&self) -> Vec<(NodeId, RequestVoteRequest)> {
        self.script.lock().unwrap().votes.clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn request_vote(
        &self,
        peer: &NodeConfiguration,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError> {
        let mut script = self.script.lock().unwrap();
        let granted = script
            .grant_votes
            .get(&peer.unique_id)
            .copied()
            .unwrap_or(false);
        let term = request.term;
        script.votes.push((peer.unique_id.clone(), request));
        Ok(RequestVoteResponse {
            term,
            vote_granted: granted,
        })
    }

    async fn append_entries(
        &self,
        peer: &NodeConfiguration,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        let mut script = self.script.lock().unwrap();
        let term = request.term;
        let scripted = script
            .conflicts
            .get_mut(&peer.unique_id)
            .and_then(|queue| queue.pop_front());
        let result = match scripted {
            Some((conflicting_term, first_index)) => Ok(AppendEntriesResponse::conflict(
                term,
                conflicting_term,
                first_index,
            )),
            None => match script
                .append
                .get(&peer.unique_id)
                .cloned()
                .unwrap_or(AppendBehaviour::Accept)
            {
                AppendBehaviour::Accept => Ok(AppendEntriesResponse::accepted(term)),
                AppendBehaviour::AcceptUpTo(limit) => {
                    let end = request.previous_log_index + request.entries.len() as LogIndex;
                    if end <= limit {
                        Ok(AppendEntriesResponse::accepted(term))
                    } else {
                        Ok(AppendEntriesResponse::conflict(term, None, limit + 1))
                    }
                }
                AppendBehaviour::Unreachable => {
                    Err(TransportError::Unreachable(peer.unique_id.clone()))
                }
            },
        };
        script.appends.push(AppendCall {
            peer: peer.unique_id.clone(),
            request,
            response: result.clone().ok(),
        });
        result
    }

    async fn install_snapshot(
        &self,
        peer: &NodeConfiguration,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, TransportError> {
        let mut script = self.script.lock().unwrap();
        let term = request.term;
        script.snapshots.push((peer.unique_id.clone(), request));
        Ok(InstallSnapshotResponse::new(term, true))
    }
}

pub struct StaticDiscovery {
    roster: Vec<NodeConfiguration>,
}

impl StaticDiscovery {
    pub fn new(roster: Vec<NodeConfiguration>) -> Arc<Self> {
        Arc::new(Self { roster })
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn enroll(&self, _this_node: &NodeConfiguration) -> Result<(), DiscoveryError> {
        Ok(())
    }

    async fn discover_peers(&self) -> Result<Vec<NodeConfiguration>, DiscoveryError> {
        Ok(self.roster.clone())
    }
}

///////////////////////////////////////////////////
// Application and storage doubles
///////////////////////////////////////////////////

#[derive(Debug, Default)]
struct Recorded {
    applied: Vec<(LogIndex, Vec<u8>)>,
    restores: Vec<SnapshotHeader>,
}

/// Echoes every command back and remembers what it saw.
#[derive(Clone, Debug, Default)]
pub struct RecordingStateMachine {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingStateMachine {
    pub fn applied(&self) -> Vec<(LogIndex, Vec<u8>)> {
        self.inner.lock().unwrap().applied.clone()
    }

    pub fn applied_indexes(&self) -> Vec<LogIndex> {
        self.applied().into_iter().map(|(i, _)| i).collect()
    }

    pub fn restores(&self) -> Vec<SnapshotHeader> {
        self.inner.lock().unwrap().restores.clone()
    }
}

impl StateMachine for RecordingStateMachine {
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Result<Vec<u8>, StateMachineError> {
        self.inner
            .lock()
            .unwrap()
            .applied
            .push((index, command.to_vec()));
        Ok(command.to_vec())
    }

    fn take_snapshot(&mut self, upto_index: LogIndex) -> Result<Vec<u8>, StateMachineError> {
        Ok(upto_index.to_be_bytes().to_vec())
    }

    fn restore_from_snapshot(
        &mut self,
        header: &SnapshotHeader,
        _data: &[u8],
    ) -> Result<(), StateMachineError> {
        self.inner.lock().unwrap().restores.push(header.clone());
        Ok(())
    }
}

/// A memory store whose term and vote writes can be made to fail.
#[derive(Clone, Debug, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_term_writes: Arc<AtomicBool>,
}

impl FlakyStore {
    pub fn fail_term_writes(&self) {
        self.fail_term_writes.store(true, Ordering::SeqCst);
    }
}

impl PersistentStore for FlakyStore {
    fn load_term(&self) -> Result<Term, StorageError> {
        self.inner.load_term()
    }

    fn load_voted_for(&self) -> Result<Option<NodeId>, StorageError> {
        self.inner.load_voted_for()
    }

    fn save_term_and_vote(
        &mut self,
        term: Term,
        voted_for: Option<&NodeId>,
    ) -> Result<(), StorageError> {
        if self.fail_term_writes.load(Ordering::SeqCst) {
            return Err(StorageError("disk full".to_string()));
        }
        self.inner.save_term_and_vote(term, voted_for)
    }

    fn load_last_index(&self) -> Result<LogIndex, StorageError> {
        self.inner.load_last_index()
    }

    fn entry(&self, index: LogIndex) -> Result<Option<LogEntry>, StorageError> {
        self.inner.entry(index)
    }

    fn entries(&self, from: LogIndex, max: usize) -> Result<Vec<LogEntry>, StorageError> {
        self.inner.entries(from, max)
    }

    fn persist_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        self.inner.persist_entries(entries)
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<(), StorageError> {
        self.inner.truncate_from(index)
    }

    fn load_last_applied(&self) -> Result<LogIndex, StorageError> {
        self.inner.load_last_applied()
    }

    fn save_last_applied(&mut self, index: LogIndex) -> Result<(), StorageError> {
        self.inner.save_last_applied(index)
    }

    fn load_snapshot(&self) -> Result<Option<(SnapshotHeader, Vec<u8>)>, StorageError> {
        self.inner.load_snapshot()
    }

    fn save_snapshot(&mut self, header: &SnapshotHeader, data: &[u8]) -> Result<(), StorageError> {
        self.inner.save_snapshot(header, data)
    }
}

///////////////////////////////////////////////////
// Harness
///////////////////////////////////////////////////

pub struct TestNode {
    pub node: Node,
    pub handle: NodeHandle,
    pub state_machine: RecordingStateMachine,
}

/// Starts node `id` against a static roster, with every other member played by `transport`.
pub async fn start_node(
    id: &str,
    roster: &[&str],
    config: EngineConfig,
    store: impl PersistentStore,
    transport: Arc<ScriptedTransport>,
) -> TestNode {
    init_tracing();
    let state_machine = RecordingStateMachine::default();
    let mut node = Node::new(
        member(id),
        config,
        store,
        state_machine.clone(),
        transport,
        StaticDiscovery::new(members(roster)),
    );
    node.initialize_configuration().await.unwrap();
    node.start().unwrap();
    let handle = node.handle();
    TestNode {
        node,
        handle,
        state_machine,
    }
}

/// Polls the node until `done` holds, failing the test after five seconds.
pub async fn wait_for(
    handle: &NodeHandle,
    what: &str,
    done: impl Fn(&RaftNodeSummary) -> bool,
) -> RaftNodeSummary {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let summary = handle.summary().await.unwrap();
        if done(&summary) {
            return summary;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}, last seen {summary:?}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_leadership(handle: &NodeHandle) -> RaftNodeSummary {
    wait_for(handle, "leadership", |s| s.is_leader()).await
}
