use rusqlite::Connection;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_levelingd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn levelingd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn seed_student(workspace: &Path) {
    let conn = Connection::open(workspace.join("leveling.sqlite3")).expect("open db");
    conn.execute(
        "INSERT INTO students(id, grade, last_name, first_name, current_section, active, sort_order)
         VALUES('s-1', 5, 'Ito', 'Mei', 'Level 2', 1, 0)",
        [],
    )
    .expect("insert student");
}

fn select_workspace(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, id: &str, path: &Path) {
    let _ = request_ok(
        stdin,
        reader,
        id,
        "workspace.select",
        json!({ "path": path.to_string_lossy() }),
    );
}

fn create_cycle(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, id: &str) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "levelTests.create",
        json!({ "grade": 5, "academicYear": "2026-2027" }),
    );
    created
        .pointer("/levelTest/id")
        .and_then(|v| v.as_str())
        .expect("level test id")
        .to_string()
}

#[test]
fn bundle_manifest_lists_open_cycles_and_restores_them() {
    let workspace = temp_dir("leveling-backup-src");
    let restored = temp_dir("leveling-backup-dst");
    let bundle = temp_dir("leveling-backup-out").join("workspace.zip");

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, "1", &workspace);
    let open_id = create_cycle(&mut stdin, &mut reader, "2");

    let export = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(
        export.pointer("/manifest/format").and_then(|v| v.as_str()),
        Some("leveling-workspace-v1")
    );
    assert_eq!(
        export
            .pointer("/manifest/openLevelTests/0/id")
            .and_then(|v| v.as_str()),
        Some(open_id.as_str())
    );
    assert_eq!(
        export
            .pointer("/manifest/dbSha256")
            .and_then(|v| v.as_str())
            .map(str::len),
        Some(64)
    );

    let import = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle.to_string_lossy(), "workspacePath": restored.to_string_lossy() }),
    );
    assert_eq!(
        import
            .pointer("/openLevelTests/0/status")
            .and_then(|v| v.as_str()),
        Some("setup")
    );

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "levelTests.get",
        json!({ "testId": open_id }),
    );
    assert_eq!(got.pointer("/levelTest/grade").and_then(|v| v.as_i64()), Some(5));
    let health = request_ok(&mut stdin, &mut reader, "6", "health", json!({}));
    assert_eq!(
        health.get("workspacePath").and_then(|v| v.as_str()),
        Some(restored.to_string_lossy().as_ref())
    );

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(restored);
}

#[test]
fn import_waits_for_unsaved_placements() {
    let workspace = temp_dir("leveling-backup-unsaved");
    let bundle = temp_dir("leveling-backup-unsaved-out").join("workspace.zip");

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, "1", &workspace);
    seed_student(&workspace);
    let test_id = create_cycle(&mut stdin, &mut reader, "2");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle.to_string_lossy() }),
    );

    // A computed board lives only in memory.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "levelTests.setPhase",
        json!({ "testId": test_id, "phase": "meeting" }),
    );
    let value = request(
        &mut stdin,
        &mut reader,
        "5",
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    assert_eq!(value.pointer("/error/code").and_then(|v| v.as_str()), Some("conflict"));
    assert_eq!(
        value
            .pointer("/error/details/levelTestIds/0")
            .and_then(|v| v.as_str()),
        Some(test_id.as_str())
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "levelTests.placementsSave",
        json!({ "testId": test_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    // The bundle predates the meeting, so the cycle is back in setup.
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "levelTests.get",
        json!({ "testId": test_id }),
    );
    assert_eq!(got.pointer("/levelTest/status").and_then(|v| v.as_str()), Some("setup"));
    assert_eq!(got.get("meetingOpen").and_then(|v| v.as_bool()), Some(false));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn tampered_bundle_leaves_current_workspace_open() {
    let workspace = temp_dir("leveling-backup-tamper");
    let bundle = temp_dir("leveling-backup-tamper-out").join("tampered.zip");
    {
        let manifest = json!({
            "format": "leveling-workspace-v1",
            "appVersion": "0.0.0",
            "exportedAt": "2026-01-01T00:00:00Z",
            "dbSha256": "00".repeat(32)
        });
        let mut zip = zip::ZipWriter::new(std::fs::File::create(&bundle).expect("create bundle"));
        let opts = zip::write::FileOptions::default();
        zip.start_file("manifest.json", opts).expect("manifest entry");
        zip.write_all(manifest.to_string().as_bytes()).expect("write manifest");
        zip.start_file("db/leveling.sqlite3", opts).expect("db entry");
        zip.write_all(b"not a database").expect("write db");
        zip.finish().expect("finish zip");
    }

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, "1", &workspace);
    let test_id = create_cycle(&mut stdin, &mut reader, "2");

    let value = request(
        &mut stdin,
        &mut reader,
        "3",
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    assert_eq!(value.pointer("/error/code").and_then(|v| v.as_str()), Some("bad_bundle"));
    let message = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    assert!(message.contains("checksum"), "{}", message);

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "levelTests.get",
        json!({ "testId": test_id }),
    );
    assert_eq!(got.pointer("/levelTest/id").and_then(|v| v.as_str()), Some(test_id.as_str()));

    let _ = std::fs::remove_dir_all(workspace);
}
