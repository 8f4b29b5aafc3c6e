use std::sync::Arc;

use vibesdk_core::db::Db;
use vibesdk_core::workspace::Workspace;

fn open_workspace() -> Arc<Workspace> {
    let db = Arc::new(Db::open(":memory:").expect("open in-memory db"));
    db.migrate_agent().expect("migrate");
    let mut ws = Workspace::new(db);
    ws.init("main").expect("init");
    Arc::new(ws)
}

fn file(path: &str, contents: &str) -> (String, String) {
    (path.to_string(), contents.to_string())
}

#[test]
fn first_commit_has_no_parent_and_advances_head() {
    let ws = open_workspace();
    assert_eq!(ws.head_oid().expect("head"), None);

    let info = ws
        .commit(&[file("src/App.tsx", "export default () => null;\n")], "feat: initial")
        .expect("commit")
        .expect("commit created");

    assert_eq!(ws.head_oid().expect("head"), Some(info.oid.clone()));
    assert_eq!(info.message, "feat: initial");
    assert!(info.author.starts_with("Vibesdk <"));
}

#[test]
fn identical_content_second_commit_is_noop() {
    let ws = open_workspace();
    let contents = "body { margin: 0 }\n";

    let first = ws
        .commit(&[file("src/index.css", contents)], "feat: styles")
        .expect("commit");
    assert!(first.is_some());
    let head_before = ws.head_oid().expect("head");

    let second = ws
        .commit(&[file("src/index.css", contents)], "feat: styles again")
        .expect("commit");
    assert!(second.is_none(), "identical content must not commit");
    assert_eq!(ws.head_oid().expect("head"), head_before);
    assert_eq!(ws.log(100).len(), 1);
}

#[test]
fn log_walks_parents_newest_first() {
    let ws = open_workspace();
    ws.commit(&[file("a.ts", "1")], "one").expect("commit");
    ws.commit(&[file("a.ts", "2")], "two").expect("commit");
    ws.commit(&[file("b.ts", "3")], "three").expect("commit");

    let log = ws.log(10);
    assert_eq!(log.len(), 3);
    assert_eq!(log[0].message, "three");
    assert_eq!(log[1].message, "two");
    assert_eq!(log[2].message, "one");

    let limited = ws.log(2);
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].message, "three");
}

#[test]
fn show_lists_files_reachable_from_commit_tree() {
    let ws = open_workspace();
    let info = ws
        .commit(
            &[
                file("src/App.tsx", "app"),
                file("src/components/Button.tsx", "btn"),
                file("package.json", "{}"),
            ],
            "feat: layout",
        )
        .expect("commit")
        .expect("created");

    let details = ws.show(&info.oid).expect("show");
    assert_eq!(details.file_count, 3);
    assert!(details.files.contains(&"src/App.tsx".to_string()));
    assert!(details.files.contains(&"src/components/Button.tsx".to_string()));
    assert!(details.files.contains(&"package.json".to_string()));
}

#[test]
fn read_files_from_commit_skips_binary_blobs() {
    let ws = open_workspace();
    // A null byte is valid UTF-8, so it survives staging; the binary-file
    // heuristic must still skip it on readback.
    let binary = String::from_utf8(vec![b'a', 0, b'b']).expect("null is valid utf-8");
    let info = ws
        .commit(&[file("ok.txt", "hello"), file("blob.bin", &binary)], "mix")
        .expect("commit")
        .expect("created");

    let files = ws.read_files_from_commit(&info.oid).expect("read");
    let paths: Vec<&str> = files.iter().map(|(p, _)| p.as_str()).collect();
    assert!(paths.contains(&"ok.txt"));
    assert!(!paths.contains(&"blob.bin"));
}

#[test]
fn reset_hard_rewrites_index_and_reports_count() {
    let ws = open_workspace();
    let first = ws
        .commit(&[file("a.ts", "v1"), file("b.ts", "v1")], "first")
        .expect("commit")
        .expect("created");
    ws.commit(&[file("a.ts", "v2")], "second").expect("commit");

    let result = ws.reset(&first.oid, true).expect("reset");
    assert_eq!(result.oid, first.oid);
    assert_eq!(result.files_reset, 2);
    assert_eq!(ws.head_oid().expect("head"), Some(first.oid.clone()));

    // Matrix is clean after a hard reset: nothing left to commit.
    let again = ws
        .commit(&[file("a.ts", "v1")], "noop")
        .expect("commit");
    assert!(again.is_none());
}

#[test]
fn reset_fires_files_changed_callback() {
    let ws = open_workspace();
    let changed: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
    let sink = Arc::clone(&changed);
    ws.set_files_changed_callback(Box::new(move |paths| {
        sink.lock().unwrap_or_else(|e| e.into_inner()).extend(paths.iter().cloned());
    }));

    let info = ws
        .commit(&[file("x.ts", "1")], "one")
        .expect("commit")
        .expect("created");
    ws.reset(&info.oid, true).expect("reset");

    let seen = changed.lock().unwrap_or_else(|e| e.into_inner());
    assert_eq!(seen.as_slice(), ["x.ts"]);
}

#[test]
fn export_import_round_trips_log() {
    let ws = open_workspace();
    ws.commit(&[file("src/a.ts", "1")], "one").expect("commit");
    ws.commit(&[file("src/a.ts", "2"), file("src/b.ts", "x")], "two")
        .expect("commit");

    let objects = ws.export_git_objects().expect("export");
    assert!(objects.iter().any(|o| o.path.starts_with("objects/")));
    assert!(objects.iter().any(|o| o.path == "HEAD"));

    let fresh = open_workspace();
    fresh.import_git_objects(&objects).expect("import");

    let original: Vec<_> = ws
        .log(100)
        .into_iter()
        .map(|c| (c.oid, c.message, c.timestamp))
        .collect();
    let restored: Vec<_> = fresh
        .log(100)
        .into_iter()
        .map(|c| (c.oid, c.message, c.timestamp))
        .collect();
    assert_eq!(original, restored);
}

#[tokio::test]
async fn get_head_returns_oid_within_watchdog() {
    let ws = open_workspace();
    let info = ws
        .commit(&[file("a.ts", "1")], "one")
        .expect("commit")
        .expect("created");
    let head = ws.get_head().await.expect("get_head");
    assert_eq!(head, Some(info.oid));
}

#[test]
fn leading_slash_paths_are_normalized() {
    let ws = open_workspace();
    ws.commit(&[file("/src/App.tsx", "v1")], "one").expect("commit");
    // Same logical path without the slash: identical content, no new commit.
    let second = ws.commit(&[file("src/App.tsx", "v1")], "two").expect("commit");
    assert!(second.is_none());
}
