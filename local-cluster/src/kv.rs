use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use jointraft_raft::msg::{LogIndex, SnapshotHeader};
use jointraft_raft::{StateMachine, StateMachineError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Set { key: String, value: String },
    Get { key: String },
    Delete { key: String },
}

impl KvCommand {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        KvCommand::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        KvCommand::Get { key: key.into() }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        KvCommand::Delete { key: key.into() }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Output of every command: the value held under the key before the command ran.
pub type KvOutput = Option<String>;

pub fn decode_output(bytes: &[u8]) -> Result<KvOutput, serde_json::Error> {
    serde_json::from_slice(bytes)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KvState {
    data: BTreeMap<String, String>,
    last_applied: LogIndex,
}

/// String key/value store replicated through the log. Clones share state, so a node restarted
/// from the same instance sees everything applied before the crash.
#[derive(Clone, Debug, Default)]
pub struct KvStateMachine {
    inner: Arc<Mutex<KvState>>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, KvState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.state().data.get(key).cloned()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.state().last_applied
    }

    pub fn entries(&self) -> BTreeMap<String, String> {
        self.state().data.clone()
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Result<Vec<u8>, StateMachineError> {
        let command: KvCommand = serde_json::from_slice(command)
            .map_err(|e| StateMachineError(format!("undecodable command at {index}: {e}")))?;
        let mut state = self.state();
        let output: KvOutput = match command {
            KvCommand::Set { key, value } => state.data.insert(key, value),
            KvCommand::Get { key } => state.data.get(&key).cloned(),
            KvCommand::Delete { key } => state.data.remove(&key),
        };
        state.last_applied = index;
        serde_json::to_vec(&output).map_err(|e| StateMachineError(e.to_string()))
    }

    fn take_snapshot(&mut self, upto_index: LogIndex) -> Result<Vec<u8>, StateMachineError> {
        let state = self.state();
        // Entries that never reach the store (no-ops, configuration) leave gaps.
        if state.last_applied > upto_index {
            return Err(StateMachineError(format!(
                "asked for snapshot at {upto_index}, already applied {}",
                state.last_applied
            )));
        }
        serde_json::to_vec(&*state).map_err(|e| StateMachineError(e.to_string()))
    }

    fn restore_from_snapshot(
        &mut self,
        header: &SnapshotHeader,
        data: &[u8],
    ) -> Result<(), StateMachineError> {
        let restored: KvState = serde_json::from_slice(data).map_err(|e| {
            StateMachineError(format!("corrupt snapshot {}: {e}", header.snapshot_id))
        })?;
        *self.state() = restored;
        Ok(())
    }
}
