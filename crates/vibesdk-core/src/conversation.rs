//! Conversation log: per session id, a running (compacted) history and a
//! full history, persisted as JSON columns in the agent-local tables.
//! Insertion with an existing conversation id replaces the message in place
//! (streaming updates rewrite their own entry).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use crate::db::Db;
use crate::types::ConversationMessage;

const FULL_TABLE: &str = "full_conversations";
const COMPACT_TABLE: &str = "compact_conversations";

#[derive(Debug, Clone, Default)]
pub struct ConversationHistories {
    pub running: Vec<ConversationMessage>,
    pub full: Vec<ConversationMessage>,
}

#[derive(Clone)]
pub struct ConversationLog {
    db: Arc<Db>,
}

impl ConversationLog {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Load both histories. If one store is empty the other backfills it
    /// (migration from installs that only wrote a single history).
    pub fn get(&self, session_id: &str) -> Result<ConversationHistories> {
        let mut running = self.read(COMPACT_TABLE, session_id)?;
        let mut full = self.read(FULL_TABLE, session_id)?;
        if running.is_empty() && !full.is_empty() {
            running = full.clone();
        } else if full.is_empty() && !running.is_empty() {
            full = running.clone();
        }
        Ok(ConversationHistories {
            running: dedup_by_id(running),
            full: dedup_by_id(full),
        })
    }

    pub fn set(&self, session_id: &str, histories: &ConversationHistories) -> Result<()> {
        self.write(COMPACT_TABLE, session_id, &histories.running)?;
        self.write(FULL_TABLE, session_id, &histories.full)?;
        Ok(())
    }

    /// Insert-or-replace by conversation id in both histories.
    pub fn add(&self, session_id: &str, message: ConversationMessage) -> Result<()> {
        let mut histories = self.get(session_id)?;
        upsert(&mut histories.running, message.clone());
        upsert(&mut histories.full, message);
        self.set(session_id, &histories)
    }

    pub fn clear(&self, session_id: &str) -> Result<()> {
        self.set(session_id, &ConversationHistories::default())
    }

    fn read(&self, table: &str, session_id: &str) -> Result<Vec<ConversationMessage>> {
        let Some(json) = self.db.get_conversation_json(table, session_id)? else {
            return Ok(Vec::new());
        };
        Ok(serde_json::from_str(&json).unwrap_or_default())
    }

    fn write(&self, table: &str, session_id: &str, messages: &[ConversationMessage]) -> Result<()> {
        let json = serde_json::to_string(messages)?;
        self.db.set_conversation_json(table, session_id, &json)
    }
}

fn upsert(messages: &mut Vec<ConversationMessage>, message: ConversationMessage) {
    match messages
        .iter_mut()
        .find(|m| m.conversation_id == message.conversation_id)
    {
        Some(existing) => *existing = message,
        None => messages.push(message),
    }
}

/// Remove any duplicates that survived older write paths, keeping the last
/// occurrence of each id in its first position.
fn dedup_by_id(messages: Vec<ConversationMessage>) -> Vec<ConversationMessage> {
    let mut by_id: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<ConversationMessage> = Vec::with_capacity(messages.len());
    for message in messages {
        match by_id.get(&message.conversation_id) {
            Some(&idx) => out[idx] = message,
            None => {
                by_id.insert(message.conversation_id.clone(), out.len());
                out.push(message);
            }
        }
    }
    out
}
