use serde_json::json;
use std::collections::HashMap;
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
fn seven_teachers_over_three_clusters_rotate_322() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let ws = temp_dir("clusterd-rr");
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
        json!({ "branch": "BLR", "batch": "2024-2026", "targetCount": 3 }),
    );

    let mut teachers: Vec<_> = (1..=7)
        .map(|n| {
            json!({
                "teacherId": format!("T{:02}", n),
                "name": format!("Teacher {:02}", n),
                "branch": "BLR",
                "role": "teacher",
            })
        })
        .collect();
    // Neither non-teacher staff nor inactive teachers take part in rotation.
    teachers.push(json!({
        "teacherId": "T90", "name": "Admin", "branch": "BLR", "role": "admin",
    }));
    teachers.push(json!({
        "teacherId": "T91", "name": "On leave", "branch": "BLR", "role": "teacher",
        "active": false,
    }));
    request_ok(
        &mut stdin,
        &mut reader,
        "sync",
        "roster.syncTeachers",
        json!({ "teachers": teachers }),
    );

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "create",
        "sessions.create",
        json!({ "branch": "BLR", "batch": "2024-2026", "startDate": "2026-03-02" }),
    );
    let assignments = result["assignments"].as_array().expect("assignments");
    assert_eq!(assignments.len(), 7);
    assert!(result.get("warning").is_none(), "unexpected warning");

    let mut per_cluster: HashMap<String, i64> = HashMap::new();
    for a in assignments {
        assert_eq!(a["status"].as_str(), Some("pending"));
        *per_cluster
            .entry(a["clusterId"].as_str().expect("clusterId").to_string())
            .or_insert(0) += 1;
    }
    assert_eq!(per_cluster.get("BLR-2024-2026-1"), Some(&3));
    assert_eq!(per_cluster.get("BLR-2024-2026-2"), Some(&2));
    assert_eq!(per_cluster.get("BLR-2024-2026-3"), Some(&2));

    // Rotation follows roster order: T01 -> cluster 1, T02 -> 2, T03 -> 3, T04 -> 1, ...
    for a in assignments {
        let t: usize = a["teacherId"].as_str().unwrap()[1..].parse().unwrap();
        let expected = format!("BLR-2024-2026-{}", (t - 1) % 3 + 1);
        assert_eq!(a["clusterId"].as_str(), Some(expected.as_str()));
    }

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn empty_roster_still_creates_a_session_shell() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let ws = temp_dir("clusterd-shell");
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

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "create",
        "sessions.create",
        json!({ "branch": "BLR", "batch": "2024-2026", "startDate": "2026-03-02" }),
    );
    assert!(result["session"]["id"].as_str().is_some());
    assert_eq!(result["assignments"].as_array().map(|a| a.len()), Some(0));
    assert_eq!(result["warning"]["code"].as_str(), Some("validation"));

    // The shell is persisted.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "sessions.list",
        json!({ "branch": "BLR" }),
    );
    assert_eq!(listed["sessions"].as_array().map(|s| s.len()), Some(1));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn duplicate_period_is_rejected() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let ws = temp_dir("clusterd-dup");
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
        json!({ "branch": "BLR", "batch": "2024-2026", "targetCount": 1 }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "c1",
        "sessions.create",
        json!({ "branch": "BLR", "batch": "2024-2026", "startDate": "2026-03-02" }),
    );
    let session_id = created["session"]["id"].as_str().expect("id").to_string();

    let resp = request(
        &mut stdin,
        &mut reader,
        "c2",
        "sessions.create",
        json!({ "branch": "BLR", "batch": "2024-2026", "startDate": "2026-03-02" }),
    );
    assert_eq!(resp["ok"].as_bool(), Some(false));
    assert_eq!(resp["error"]["code"].as_str(), Some("validation"));

    // Deleting the session frees the period for recreation.
    request_ok(
        &mut stdin,
        &mut reader,
        "del",
        "sessions.delete",
        json!({ "sessionId": session_id }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "c2b",
        "sessions.create",
        json!({ "branch": "BLR", "batch": "2024-2026", "startDate": "2026-03-02" }),
    );
    let resp = request(
        &mut stdin,
        &mut reader,
        "del2",
        "sessions.delete",
        json!({ "sessionId": "nope" }),
    );
    assert_eq!(resp["error"]["code"].as_str(), Some("not_found"));

    // A different branch may reuse the same period.
    request_ok(
        &mut stdin,
        &mut reader,
        "ensure2",
        "clusters.ensure",
        json!({ "branch": "HYD", "batch": "2024-2026", "targetCount": 1 }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "c3",
        "sessions.create",
        json!({ "branch": "HYD", "batch": "2024-2026", "startDate": "2026-03-02" }),
    );

    drop(stdin);
    let _ = child.wait();
}
