use std::{future::Future, sync::Arc, time::Duration};
use tokio::{sync::mpsc, time};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::msg::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    LogIndex, NodeConfiguration, NodeId, RequestVoteRequest, RequestVoteResponse,
};
use crate::transport::Transport;

/// Replies from peers, fed back into the node loop. `epoch` identifies the role instance that
/// issued the request; anything from an older epoch is stale.
#[derive(Debug)]
pub(crate) enum PeerReply {
    Vote {
        peer: NodeId,
        epoch: u64,
        result: Result<RequestVoteResponse, TransportError>,
    },
    Append {
        peer: NodeId,
        epoch: u64,
        previous_log_index: LogIndex,
        entry_count: u64,
        result: Result<AppendEntriesResponse, TransportError>,
    },
    Snapshot {
        peer: NodeId,
        epoch: u64,
        last_included_index: LogIndex,
        result: Result<InstallSnapshotResponse, TransportError>,
    },
}

impl PeerReply {
    pub fn epoch(&self) -> u64 {
        match self {
            PeerReply::Vote { epoch, .. }
            | PeerReply::Append { epoch, .. }
            | PeerReply::Snapshot { epoch, .. } => *epoch,
        }
    }
}

/// Fans RPCs out as independent tasks so no peer can hold up another.
#[derive(Clone)]
pub(crate) struct Outbound {
    transport: Arc<dyn Transport>,
    replies_tx: mpsc::Sender<PeerReply>,
    rpc_timeout: Duration,
}

impl Outbound {
    pub fn new(
        transport: Arc<dyn Transport>,
        replies_tx: mpsc::Sender<PeerReply>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            replies_tx,
            rpc_timeout,
        }
    }

    pub fn request_vote(
        &self,
        peer: NodeConfiguration,
        request: RequestVoteRequest,
        epoch: u64,
        cancel: CancellationToken,
    ) {
        let transport = self.transport.clone();
        let peer_id = peer.unique_id.clone();
        let call = async move { transport.request_vote(&peer, request).await };
        self.dispatch(peer_id, cancel, call, move |peer, result| PeerReply::Vote {
            peer,
            epoch,
            result,
        });
    }

    pub fn append_entries(
        &self,
        peer: NodeConfiguration,
        request: AppendEntriesRequest,
        epoch: u64,
        cancel: CancellationToken,
    ) {
        let transport = self.transport.clone();
        let peer_id = peer.unique_id.clone();
        let previous_log_index = request.previous_log_index;
        let entry_count = request.entries.len() as u64;
        let call = async move { transport.append_entries(&peer, request).await };
        self.dispatch(peer_id, cancel, call, move |peer, result| PeerReply::Append {
            peer,
            epoch,
            previous_log_index,
            entry_count,
            result,
        });
    }

    pub fn install_snapshot(
        &self,
        peer: NodeConfiguration,
        request: InstallSnapshotRequest,
        epoch: u64,
        cancel: CancellationToken,
    ) {
        let transport = self.transport.clone();
        let peer_id = peer.unique_id.clone();
        let last_included_index = request.snapshot_header.last_included_index;
        let call = async move { transport.install_snapshot(&peer, request).await };
        self.dispatch(peer_id, cancel, call, move |peer, result| PeerReply::Snapshot {
            peer,
            epoch,
            last_included_index,
            result,
        });
    }

    /// Runs `call` under the RPC timeout. Nothing is reported once `cancel` fires.
    fn dispatch<R, F, W>(&self, peer: NodeId, cancel: CancellationToken, call: F, wrap: W)
    where
        R: Send + 'static,
        F: Future<Output = Result<R, TransportError>> + Send + 'static,
        W: FnOnce(NodeId, Result<R, TransportError>) -> PeerReply + Send + 'static,
    {
        let replies_tx = self.replies_tx.clone();
        let rpc_timeout = self.rpc_timeout;
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = time::timeout(rpc_timeout, call) => {
                    outcome.unwrap_or(Err(TransportError::Timeout))
                }
            };
            // The node loop may be gone already; that is fine.
            let _ = replies_tx.send(wrap(peer, result)).await;
        });
    }
}
