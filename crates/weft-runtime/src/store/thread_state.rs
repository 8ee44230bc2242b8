use super::interrupt::{attachment_id, interrupt_id};
use super::StoreError;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use weft_contract::{
    gen_message_id, now_unix_millis, Block, BlockKind, DisplayMode, InterruptRecord, Message,
    MessageSubtype, PersistedSnapshot, ThreadSnapshot, UiEvent, UiMessage, UiReducer,
};

/// Accumulated state of one message id.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MessageRecord {
    /// Concatenable accumulator fed by stream deltas.
    Chunk(Message),
    /// Terminal message from a `values` snapshot or a non-chunk kind.
    Full(Message),
}

impl MessageRecord {
    pub(crate) fn message(&self) -> &Message {
        match self {
            Self::Chunk(m) | Self::Full(m) => m,
        }
    }
}

/// Position entry in the block order. Content is resolved from the maps at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BlockSlot {
    pub(crate) id: String,
    pub(crate) kind: BlockKind,
    pub(crate) entity_id: String,
}

#[derive(Debug, Default)]
pub(crate) struct ThreadState {
    messages: HashMap<String, MessageRecord>,
    visible: HashSet<String>,
    ui: HashMap<String, UiMessage>,
    ui_order: Vec<String>,
    interrupts: HashMap<String, InterruptRecord>,
    blocks: Vec<BlockSlot>,
    block_ids: HashSet<String>,
    optimistic: HashMap<String, Value>,
    last_message_block: Option<String>,
    last_updated_at: u64,
}

impl ThreadState {
    fn touch(&mut self) {
        self.last_updated_at = now_unix_millis().max(self.last_updated_at);
    }

    fn position(&self, block_id: &str) -> Option<usize> {
        self.blocks.iter().position(|slot| slot.id == block_id)
    }

    /// Append a block for the entity if it has none yet. Returns true when created.
    fn ensure_block(&mut self, kind: BlockKind, entity_id: &str) -> bool {
        let id = kind.block_id(entity_id);
        if self.block_ids.contains(&id) {
            return false;
        }
        self.block_ids.insert(id.clone());
        if kind == BlockKind::Message {
            self.last_message_block = Some(id.clone());
        }
        self.blocks.push(BlockSlot {
            id,
            kind,
            entity_id: entity_id.to_string(),
        });
        true
    }

    pub(crate) fn apply_message(
        &mut self,
        payload: &Value,
        subtype: MessageSubtype,
        mode: DisplayMode,
    ) -> Result<(), StoreError> {
        let Some(message) = Message::from_value(payload) else {
            if subtype == MessageSubtype::Metadata {
                tracing::trace!("metadata event without a message body");
                return Ok(());
            }
            return Err(StoreError::Serialization(
                "payload is not a serialized message".to_string(),
            ));
        };
        let id = message.id.clone().ok_or(StoreError::MissingMessageId)?;

        let record = if !message.is_chunk_kind() {
            MessageRecord::Full(message)
        } else if subtype == MessageSubtype::Partial {
            MessageRecord::Chunk(message)
        } else {
            match self.messages.get(&id) {
                Some(MessageRecord::Chunk(prev)) => MessageRecord::Chunk(prev.concat(&message)),
                _ => MessageRecord::Chunk(message),
            }
        };
        self.messages.insert(id.clone(), record);
        self.ensure_block(BlockKind::Message, &id);

        if mode == DisplayMode::Append || subtype != MessageSubtype::Partial {
            self.visible.insert(id);
        }
        self.touch();
        Ok(())
    }

    pub(crate) fn apply_ui(&mut self, event: &UiEvent, reducer: &dyn UiReducer) {
        let prior: Vec<UiMessage> = self
            .ui_order
            .iter()
            .filter_map(|id| self.ui.get(id).cloned())
            .collect();
        let next = reducer.reduce(prior, event);

        let mut by_id = HashMap::with_capacity(next.len());
        let mut order = Vec::with_capacity(next.len());
        for ui in next {
            if !by_id.contains_key(&ui.id) {
                order.push(ui.id.clone());
            }
            self.ensure_block(BlockKind::Ui, &ui.id);
            by_id.insert(ui.id.clone(), ui);
        }
        self.ui = by_id;
        self.ui_order = order;
        self.touch();
    }

    pub(crate) fn upsert_ui(&mut self, ui: UiMessage) {
        if !self.ui.contains_key(&ui.id) {
            self.ui_order.push(ui.id.clone());
        }
        self.ensure_block(BlockKind::Ui, &ui.id);
        self.ui.insert(ui.id.clone(), ui);
    }

    pub(crate) fn apply_values(&mut self, state: &Value) -> Vec<Value> {
        if let Some(messages) = state.get("messages").and_then(Value::as_array) {
            for raw in messages {
                let Some(message) = Message::from_value(raw) else {
                    continue;
                };
                let Some(id) = message.id.clone() else {
                    continue;
                };
                self.messages.insert(id.clone(), MessageRecord::Full(message));
                self.ensure_block(BlockKind::Message, &id);
                self.visible.insert(id);
            }
        }

        if let Some(items) = state.get("ui").and_then(Value::as_array) {
            for raw in items {
                if let Some(ui) = UiMessage::from_value(raw) {
                    self.upsert_ui(ui);
                }
            }
        }

        self.touch();

        match state.get("__interrupt__") {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(single) => vec![single.clone()],
        }
    }

    pub(crate) fn apply_interrupt(&mut self, payload: &Value) -> String {
        let id = interrupt_id(payload);
        if let Some(record) = self.interrupts.get_mut(&id) {
            record.value = payload.clone();
            self.touch();
            return id;
        }

        let block_id = BlockKind::Interrupt.block_id(&id);
        // Removed widgets keep their slot but are not valid anchors.
        let anchor = attachment_id(payload)
            .filter(|ui_id| self.ui.contains_key(*ui_id))
            .map(|ui_id| BlockKind::Ui.block_id(ui_id))
            .or_else(|| self.last_message_block.clone());

        let insert_at = match anchor.as_deref().and_then(|a| self.position(a)) {
            Some(pos) => {
                let mut at = pos + 1;
                while self
                    .blocks
                    .get(at)
                    .is_some_and(|slot| slot.kind == BlockKind::Interrupt)
                {
                    at += 1;
                }
                at
            }
            None => self.blocks.len(),
        };

        let mut record = InterruptRecord::new(id.clone(), payload.clone());
        record.anchored_after = anchor;
        self.interrupts.insert(id.clone(), record);
        self.block_ids.insert(block_id.clone());
        self.blocks.insert(
            insert_at,
            BlockSlot {
                id: block_id,
                kind: BlockKind::Interrupt,
                entity_id: id.clone(),
            },
        );
        self.touch();
        id
    }

    pub(crate) fn complete_interrupt(
        &mut self,
        interrupt_id: &str,
        frozen_value: Option<Value>,
    ) -> Result<(), StoreError> {
        let id = interrupt_id
            .strip_prefix("interrupt:")
            .unwrap_or(interrupt_id);
        let record = self
            .interrupts
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownInterrupt(id.to_string()))?;
        record.complete(frozen_value);
        self.touch();
        Ok(())
    }

    pub(crate) fn interrupts_after_block(&self, block_id: &str) -> Vec<InterruptRecord> {
        self.blocks
            .iter()
            .filter(|slot| slot.kind == BlockKind::Interrupt)
            .filter_map(|slot| self.interrupts.get(&slot.entity_id))
            .filter(|record| record.anchored_after.as_deref() == Some(block_id))
            .cloned()
            .collect()
    }

    /// Insert a provisional message block. Returns the message id used.
    pub(crate) fn add_optimistic(&mut self, provisional: Value) -> String {
        let data = provisional_message(provisional);
        let id = data
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(gen_message_id);
        self.optimistic.insert(id.clone(), data);
        self.ensure_block(BlockKind::Message, &id);
        self.touch();
        id
    }

    fn resolve_message(&self, id: &str) -> Option<Value> {
        if self.visible.contains(id) {
            if let Some(record) = self.messages.get(id) {
                return Some(record.message().to_value());
            }
        }
        self.optimistic.get(id).cloned()
    }

    pub(crate) fn snapshot(&self) -> ThreadSnapshot {
        let mut snapshot = ThreadSnapshot::empty_at(self.last_updated_at);
        for slot in &self.blocks {
            let data = match slot.kind {
                BlockKind::Message => {
                    let Some(data) = self.resolve_message(&slot.entity_id) else {
                        continue;
                    };
                    snapshot.messages.push(data.clone());
                    data
                }
                BlockKind::Ui => {
                    // Tombstoned slot. It is not persisted, so it only holds the
                    // position until the thread is rehydrated.
                    let Some(ui) = self.ui.get(&slot.entity_id) else {
                        continue;
                    };
                    let data = ui.to_value();
                    snapshot.ui.push(data.clone());
                    data
                }
                BlockKind::Interrupt => {
                    let Some(record) = self.interrupts.get(&slot.entity_id) else {
                        continue;
                    };
                    serde_json::to_value(record).unwrap_or(Value::Null)
                }
            };
            snapshot.blocks.push(Block {
                id: slot.id.clone(),
                kind: slot.kind,
                data,
            });
        }
        snapshot
    }

    /// Rebuild from a persisted snapshot.
    pub(crate) fn from_persisted(persisted: &PersistedSnapshot) -> Self {
        let mut state = Self::default();
        for block in &persisted.blocks {
            let entity = block.entity_id().to_string();
            let restored = match block.kind {
                BlockKind::Message => match Message::from_value(&block.data) {
                    Some(message) => {
                        state.messages.insert(entity.clone(), MessageRecord::Full(message));
                        state.visible.insert(entity.clone());
                        true
                    }
                    None => false,
                },
                BlockKind::Ui => match UiMessage::from_value(&block.data) {
                    Some(ui) => {
                        state.ui_order.push(entity.clone());
                        state.ui.insert(entity.clone(), ui);
                        true
                    }
                    None => false,
                },
                BlockKind::Interrupt => {
                    match serde_json::from_value::<InterruptRecord>(block.data.clone()) {
                        Ok(record) => {
                            state.interrupts.insert(entity.clone(), record);
                            true
                        }
                        Err(_) => false,
                    }
                }
            };
            if !restored {
                tracing::warn!(block_id = %block.id, "skipping unreadable persisted block");
                continue;
            }
            if state.block_ids.insert(block.id.clone()) {
                if block.kind == BlockKind::Message {
                    state.last_message_block = Some(block.id.clone());
                }
                state.blocks.push(BlockSlot {
                    id: block.id.clone(),
                    kind: block.kind,
                    entity_id: entity,
                });
            }
        }
        state.last_updated_at = if persisted.last_updated_at > 0 {
            persisted.last_updated_at
        } else {
            now_unix_millis()
        };
        state
    }
}

/// Normalize caller-supplied provisional data into a message dict with type, id and content.
fn provisional_message(provisional: Value) -> Value {
    let provisional = match provisional {
        Value::String(text) => serde_json::json!({ "type": "human", "content": text }),
        Value::Object(mut obj) => {
            obj.entry("type")
                .or_insert_with(|| Value::String("human".to_string()));
            Value::Object(obj)
        }
        other => serde_json::json!({ "type": "human", "content": other }),
    };
    match Message::from_value(&provisional) {
        Some(mut message) => {
            if message.id.is_none() {
                message.id = Some(gen_message_id());
            }
            message.to_value()
        }
        None => {
            let mut provisional = provisional;
            if let Some(obj) = provisional.as_object_mut() {
                obj.entry("id")
                    .or_insert_with(|| Value::String(gen_message_id()));
            }
            provisional
        }
    }
}
