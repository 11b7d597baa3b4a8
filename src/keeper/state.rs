//! Keeper state file
//!
//! Format: [MAGIC][LEN][PAYLOAD][CRC32]
//! - MAGIC: "AFK1"
//! - LEN: payload length, u32 little endian
//! - PAYLOAD: bincode-encoded [`KeeperState`]
//! - CRC32: over the payload, u32 little endian
//!
//! Saved by writing a sibling temp file, syncing it and renaming it over the
//! previous state, so a crash leaves either the old or the new state.

use crate::common::error::{Error, Result};
use crate::common::fsm::NodeState;
use crate::common::protocol::{GroupId, NodeId};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const STATE_MAGIC: [u8; 4] = [0x41, 0x46, 0x4B, 0x31]; // "AFK1"
const HEADER_LEN: usize = 8;
const MAX_PAYLOAD: usize = 1024 * 1024;

/// What the keeper must remember across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeeperState {
    pub node_id: Option<NodeId>,
    pub group_id: Option<GroupId>,
    pub formation: String,
    pub current_state: NodeState,
    /// Last goal received from the monitor
    pub goal_state: NodeState,
    /// Version of the last report sent, bumped before each send
    pub report_version: u64,
    pub applied_membership: u64,
    pub applied_quorum_version: u64,
    /// Node the local database currently replicates from
    pub upstream: Option<NodeId>,
    /// Keeper clock, milliseconds; 0 before the first exchange
    pub last_monitor_contact: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl KeeperState {
    pub fn new(formation: impl Into<String>) -> Self {
        Self {
            node_id: None,
            group_id: None,
            formation: formation.into(),
            current_state: NodeState::Init,
            goal_state: NodeState::Init,
            report_version: 0,
            applied_membership: 0,
            applied_quorum_version: 0,
            upstream: None,
            last_monitor_contact: 0,
            consecutive_failures: 0,
            last_error: None,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.node_id.is_some()
    }
}

/// Durable location of a [`KeeperState`].
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// `None` when no state was ever saved.
    pub fn load(&self) -> Result<Option<KeeperState>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        decode(&bytes).map(Some)
    }

    /// Atomically replace the saved state.
    pub fn save(&self, state: &KeeperState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let bytes = encode(state)?;
        let temp = self.temp_path();
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;

        // make the rename itself durable
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            }) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

fn encode(state: &KeeperState) -> Result<Vec<u8>> {
    let payload = bincode::serialize(state)
        .map_err(|e| Error::Internal(format!("Serialize error: {}", e)))?;
    let crc = crc32fast::hash(&payload);

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len() + 4);
    bytes.extend_from_slice(&STATE_MAGIC);
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&payload);
    bytes.extend_from_slice(&crc.to_le_bytes());
    Ok(bytes)
}

fn decode(bytes: &[u8]) -> Result<KeeperState> {
    if bytes.len() < HEADER_LEN + 4 {
        return Err(Error::Corrupted(format!(
            "state file too short: {} bytes",
            bytes.len()
        )));
    }
    if bytes[..4] != STATE_MAGIC {
        return Err(Error::Corrupted("invalid state file magic".into()));
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&bytes[4..HEADER_LEN]);
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_PAYLOAD || bytes.len() != HEADER_LEN + len + 4 {
        return Err(Error::Corrupted(format!(
            "state file length mismatch: header says {}, file has {}",
            len,
            bytes.len().saturating_sub(HEADER_LEN + 4)
        )));
    }

    let payload = &bytes[HEADER_LEN..HEADER_LEN + len];
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&bytes[HEADER_LEN + len..]);
    let expected = u32::from_le_bytes(crc_bytes);
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(Error::ChecksumMismatch { expected, actual });
    }

    bincode::deserialize(payload).map_err(|e| Error::Corrupted(e.to_string()))
}
