use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
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
    let exe = env!("CARGO_BIN_EXE_clusterd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn clusterd");
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
        id,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn export_then_import_restores_the_allocation_state() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let ws = temp_dir("clusterd-backup-src");
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": ws.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "ensure",
        "clusters.ensure",
        json!({ "branch": "BLR", "batch": "2024-2026", "targetCount": 2 }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "sync",
        "roster.syncStudents",
        json!({ "students": [
            { "applicationNumber": "A001", "name": "One", "branch": "BLR", "batch": "2024-2026" },
            { "applicationNumber": "A002", "name": "Two", "branch": "BLR", "batch": "2024-2026" },
        ]}),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "assign",
        "clusters.assignAll",
        json!({ "branch": "BLR", "batch": "2024-2026" }),
    );

    let bundle = temp_dir("clusterd-bundles").join("snapshot.zip");
    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "export",
        "backup.export",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(
        exported["bundleFormat"].as_str(),
        Some("clusterd-workspace-v1")
    );
    assert_eq!(exported["dbSha256"].as_str().map(|s| s.len()), Some(64));

    // Import into a fresh workspace.
    let ws2 = temp_dir("clusterd-backup-dst");
    request_ok(
        &mut stdin,
        &mut reader,
        "ws2",
        "workspace.select",
        json!({ "path": ws2.to_string_lossy() }),
    );
    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "import",
        "backup.import",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    assert_eq!(
        imported["bundleFormatDetected"].as_str(),
        Some("clusterd-workspace-v1")
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "roster.listStudents",
        json!({ "branch": "BLR" }),
    );
    let students = listed["students"].as_array().expect("students");
    assert_eq!(students.len(), 2);
    assert_eq!(students[0]["clusterId"].as_str(), Some("BLR-2024-2026-1"));
    assert_eq!(students[1]["clusterId"].as_str(), Some("BLR-2024-2026-2"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn import_rejects_a_non_bundle_file() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let ws = temp_dir("clusterd-badbundle");
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": ws.to_string_lossy() }),
    );

    let junk = temp_dir("clusterd-junk").join("not-a-bundle.zip");
    std::fs::write(&junk, b"this is not a zip archive").expect("write junk");

    let resp = request(
        &mut stdin,
        &mut reader,
        "import",
        "backup.import",
        json!({ "inPath": junk.to_string_lossy() }),
    );
    assert_eq!(resp["ok"].as_bool(), Some(false));
    assert_eq!(resp["error"]["code"].as_str(), Some("import_failed"));

    // The daemon still has a usable workspace afterwards.
    request_ok(
        &mut stdin,
        &mut reader,
        "ensure",
        "clusters.ensure",
        json!({ "branch": "BLR", "batch": "2024-2026", "targetCount": 1 }),
    );

    drop(stdin);
    let _ = child.wait();
}
