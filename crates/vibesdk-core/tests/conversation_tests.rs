use std::sync::Arc;

use vibesdk_core::conversation::{ConversationHistories, ConversationLog};
use vibesdk_core::db::Db;
use vibesdk_core::types::{ConversationMessage, MessageRole};

fn open_log() -> ConversationLog {
    let db = Arc::new(Db::open(":memory:").expect("open in-memory db"));
    db.migrate_agent().expect("migrate");
    ConversationLog::new(db)
}

fn msg(id: &str, role: MessageRole, content: &str) -> ConversationMessage {
    ConversationMessage::new(id, role, content)
}

#[test]
fn add_then_get_round_trips_both_histories() {
    let log = open_log();
    log.add("s1", msg("c1", MessageRole::User, "build a todo list"))
        .expect("add");
    log.add("s1", msg("c2", MessageRole::Assistant, "on it"))
        .expect("add");

    let histories = log.get("s1").expect("get");
    assert_eq!(histories.running.len(), 2);
    assert_eq!(histories.full.len(), 2);
    assert_eq!(histories.running[0].content, "build a todo list");
}

#[test]
fn adding_existing_id_replaces_in_place() {
    let log = open_log();
    log.add("s1", msg("stream-1", MessageRole::Assistant, "partial"))
        .expect("add");
    log.add("s1", msg("stream-1", MessageRole::Assistant, "partial + more"))
        .expect("add");
    log.add("s1", msg("stream-1", MessageRole::Assistant, "final text"))
        .expect("add");

    let histories = log.get("s1").expect("get");
    assert_eq!(histories.running.len(), 1, "streaming updates must not duplicate");
    assert_eq!(histories.running[0].content, "final text");
    assert_eq!(histories.full.len(), 1);
}

#[test]
fn empty_running_history_falls_back_to_full() {
    let log = open_log();
    // Simulate an install that only ever wrote the full history.
    log.set(
        "s2",
        &ConversationHistories {
            running: Vec::new(),
            full: vec![msg("a", MessageRole::User, "hello")],
        },
    )
    .expect("set");

    let histories = log.get("s2").expect("get");
    assert_eq!(histories.running.len(), 1);
    assert_eq!(histories.running[0].content, "hello");
}

#[test]
fn read_deduplicates_surviving_duplicates() {
    let log = open_log();
    // Write duplicates directly, bypassing add's upsert.
    log.set(
        "s3",
        &ConversationHistories {
            running: vec![
                msg("dup", MessageRole::Assistant, "old"),
                msg("other", MessageRole::User, "x"),
                msg("dup", MessageRole::Assistant, "new"),
            ],
            full: Vec::new(),
        },
    )
    .expect("set");

    let histories = log.get("s3").expect("get");
    assert_eq!(histories.running.len(), 2);
    let dup = histories
        .running
        .iter()
        .find(|m| m.conversation_id == "dup")
        .expect("dup kept");
    assert_eq!(dup.content, "new");
}

#[test]
fn sessions_are_isolated_and_clearable() {
    let log = open_log();
    log.add("a", msg("1", MessageRole::User, "for a")).expect("add");
    log.add("b", msg("1", MessageRole::User, "for b")).expect("add");

    log.clear("a").expect("clear");
    assert!(log.get("a").expect("get").running.is_empty());
    assert_eq!(log.get("b").expect("get").running.len(), 1);
}
