//! Timeline data model: blocks, materialized snapshots, and the persisted document.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Version tag written into every persisted document.
pub const SCHEMA_VERSION: u32 = 2;

/// Milliseconds since the Unix epoch, saturating on clock errors.
pub fn now_unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis().min(u128::from(u64::MAX)) as u64)
}

/// Generate a time-ordered id for locally created messages.
pub fn gen_message_id() -> String {
    format!("msg_{}", uuid::Uuid::now_v7().simple())
}

/// Discriminant of a timeline block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    Message,
    Ui,
    Interrupt,
}

impl BlockKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Ui => "ui",
            Self::Interrupt => "interrupt",
        }
    }

    /// Deterministic block id for an entity of this kind.
    pub fn block_id(self, entity_id: &str) -> String {
        format!("{}:{entity_id}", self.as_str())
    }

    /// Split a block id back into its kind and entity id.
    pub fn parse_block_id(block_id: &str) -> Option<(Self, &str)> {
        let (kind, entity) = block_id.split_once(':')?;
        let kind = match kind {
            "message" => Self::Message,
            "ui" => Self::Ui,
            "interrupt" => Self::Interrupt,
            _ => return None,
        };
        Some((kind, entity))
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One resolved entry of a thread's timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    pub kind: BlockKind,
    pub data: Value,
}

impl Block {
    /// Entity id the block was derived from.
    pub fn entity_id(&self) -> &str {
        BlockKind::parse_block_id(&self.id)
            .map(|(_, entity)| entity)
            .unwrap_or(&self.id)
    }
}

/// Human-in-the-loop pause point as stored in the timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptRecord {
    pub id: String,
    pub value: Value,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frozen_value: Option<Value>,
    /// Block id this interrupt was inserted after when first seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchored_after: Option<String>,
}

impl InterruptRecord {
    pub fn new(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            value,
            completed: false,
            frozen_value: None,
            anchored_after: None,
        }
    }

    /// Mark completed. The first completion wins; later calls keep the frozen value.
    pub fn complete(&mut self, frozen_value: Option<Value>) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.frozen_value = Some(frozen_value.unwrap_or_else(|| self.value.clone()));
    }
}

/// Whether speculative partial tokens are shown as they arrive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    /// Show every message as soon as any event for it arrives.
    #[default]
    Append,
    /// Hide a message until a base (non-partial) or `values` event confirms it.
    Hold,
}

impl FromStr for DisplayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append" => Ok(Self::Append),
            "hold" => Ok(Self::Hold),
            other => Err(format!("unknown display mode: {other:?} (expected append|hold)")),
        }
    }
}

/// Materialized view of one thread, as rendered and persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSnapshot {
    #[serde(default)]
    pub blocks: Vec<Block>,
    /// Visible messages in timeline order.
    #[serde(default)]
    pub messages: Vec<Value>,
    /// UI widget values in timeline order.
    #[serde(default)]
    pub ui: Vec<Value>,
    #[serde(default)]
    pub last_updated_at: u64,
}

impl ThreadSnapshot {
    /// Empty snapshot stamped with `last_updated_at`.
    pub fn empty_at(last_updated_at: u64) -> Self {
        Self {
            last_updated_at,
            ..Default::default()
        }
    }

    pub fn block(&self, block_id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == block_id)
    }

    pub fn block_position(&self, block_id: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.id == block_id)
    }

    pub fn block_ids(&self) -> Vec<&str> {
        self.blocks.iter().map(|b| b.id.as_str()).collect()
    }
}

/// Per-thread entry of the persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSnapshot {
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub last_updated_at: u64,
}

impl From<&ThreadSnapshot> for PersistedSnapshot {
    fn from(snapshot: &ThreadSnapshot) -> Self {
        Self {
            blocks: snapshot.blocks.clone(),
            last_updated_at: snapshot.last_updated_at,
        }
    }
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// The whole persisted cache: every thread's snapshot under one storage key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedDocument {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub threads: BTreeMap<String, PersistedSnapshot>,
}

impl Default for PersistedDocument {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            threads: BTreeMap::new(),
        }
    }
}

impl PersistedDocument {
    /// Thread ids ordered most-recently-updated first.
    pub fn recent_thread_ids(&self) -> Vec<String> {
        let mut entries: Vec<(&String, u64)> = self
            .threads
            .iter()
            .map(|(id, snap)| (id, snap.last_updated_at))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        entries.into_iter().map(|(id, _)| id.clone()).collect()
    }
}
