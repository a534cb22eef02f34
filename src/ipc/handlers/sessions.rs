use crate::alloc;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn db_query_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    }
}

fn db_update_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: None,
    }
}

fn db_commit_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    }
}

fn assignments_for_session(
    conn: &Connection,
    session_id: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, teacher_id, cluster_id, set_type, status
             FROM session_assignments
             WHERE session_id = ?
             ORDER BY id",
        )
        .map_err(db_query_err)?;
    stmt.query_map([session_id], |r| {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "teacherId": r.get::<_, String>(1)?,
            "clusterId": r.get::<_, String>(2)?,
            "setType": r.get::<_, String>(3)?,
            "status": r.get::<_, String>(4)?,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_query_err)
}

fn sessions_create(
    conn: &mut Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let branch = get_required_str(params, "branch")?;
    let batch = get_required_str(params, "batch")?;
    let start_raw = get_required_str(params, "startDate")?;
    let start = alloc::parse_start_date(&start_raw).map_err(|e| HandlerErr {
        code: "bad_params",
        message: e.message,
        details: None,
    })?;

    let start_date = start.format("%Y-%m-%d").to_string();
    let duplicate: Option<String> = conn
        .query_row(
            "SELECT id FROM sessions WHERE branch = ? AND batch = ? AND start_date = ?",
            (&branch, &batch, &start_date),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query_err)?;
    if let Some(existing) = duplicate {
        return Err(HandlerErr {
            code: "validation",
            message: format!(
                "session already exists for {}/{} starting {}",
                branch, batch, start_date
            ),
            details: Some(json!({ "sessionId": existing })),
        });
    }

    let period = alloc::period_label(start);
    let end_date = alloc::session_end(start).format("%Y-%m-%d").to_string();
    let live_set = alloc::live_set_for(start);
    let session_id = Uuid::new_v4().to_string();
    let created_at = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();

    let tx = conn.transaction().map_err(db_update_err)?;
    tx.execute(
        "INSERT INTO sessions(id, branch, batch, period, start_date, end_date, live_set, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &session_id,
            &branch,
            &batch,
            &period,
            &start_date,
            &end_date,
            live_set,
            &created_at,
        ),
    )
    .map_err(db_update_err)?;

    let cluster_ids = {
        let mut stmt = tx
            .prepare(
                "SELECT cluster_id FROM clusters WHERE branch = ? AND batch = ? ORDER BY created_seq",
            )
            .map_err(db_query_err)?;
        stmt.query_map((&branch, &batch), |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_query_err)?
    };
    let teacher_ids = {
        let mut stmt = tx
            .prepare(
                "SELECT teacher_id FROM teachers
                 WHERE branch = ? AND role = 'teacher' AND active = 1
                 ORDER BY sort_order, teacher_id",
            )
            .map_err(db_query_err)?;
        stmt.query_map([&branch], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_query_err)?
    };

    // Empty rosters still produce the session shell; the caller gets a
    // validation warning instead of a failure.
    let warning = if teacher_ids.is_empty() {
        Some(format!("no active teachers for branch {}", branch))
    } else if cluster_ids.is_empty() {
        Some(format!("no clusters for {}/{}", branch, batch))
    } else {
        None
    };

    let mut assignments = Vec::new();
    if warning.is_none() {
        for (i, teacher_id) in teacher_ids.iter().enumerate() {
            let cluster_id = &cluster_ids[alloc::rotation_cluster(i, cluster_ids.len())];
            let assignment_id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO session_assignments(id, session_id, teacher_id, cluster_id, set_type, status)
                 VALUES(?, ?, ?, ?, ?, 'pending')",
                (&assignment_id, &session_id, teacher_id, cluster_id, live_set),
            )
            .map_err(db_update_err)?;
            assignments.push(json!({
                "id": assignment_id,
                "teacherId": teacher_id,
                "clusterId": cluster_id,
                "setType": live_set,
                "status": "pending",
            }));
        }
    }
    tx.commit().map_err(db_commit_err)?;

    let mut result = json!({
        "session": {
            "id": session_id,
            "branch": branch,
            "batch": batch,
            "period": period,
            "startDate": start_date,
            "endDate": end_date,
            "liveSet": live_set,
        },
        "assignments": assignments,
    });
    if let Some(message) = warning {
        result["warning"] = json!({ "code": "validation", "message": message });
    }
    Ok(result)
}

fn sessions_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut sql = String::from(
        "SELECT id, branch, batch, period, start_date, end_date, live_set
         FROM sessions WHERE 1=1",
    );
    let mut args: Vec<Value> = Vec::new();
    if let Some(branch) = params.get("branch").and_then(|v| v.as_str()) {
        sql.push_str(" AND branch = ?");
        args.push(Value::Text(branch.to_string()));
    }
    if let Some(batch) = params.get("batch").and_then(|v| v.as_str()) {
        sql.push_str(" AND batch = ?");
        args.push(Value::Text(batch.to_string()));
    }
    sql.push_str(" ORDER BY start_date, branch, batch");

    let mut stmt = conn.prepare(&sql).map_err(db_query_err)?;
    let rows = stmt
        .query_map(params_from_iter(args), |r| {
            Ok((
                r.get::<_, String>(0)?,
                json!({
                    "branch": r.get::<_, String>(1)?,
                    "batch": r.get::<_, String>(2)?,
                    "period": r.get::<_, String>(3)?,
                    "startDate": r.get::<_, String>(4)?,
                    "endDate": r.get::<_, String>(5)?,
                    "liveSet": r.get::<_, String>(6)?,
                }),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;

    let mut sessions = Vec::with_capacity(rows.len());
    for (id, mut session) in rows {
        let assignments = assignments_for_session(conn, &id)?;
        session["id"] = json!(id);
        session["assignments"] = json!(assignments);
        sessions.push(session);
    }
    Ok(json!({ "sessions": sessions }))
}

fn sessions_delete(
    conn: &mut Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM sessions WHERE id = ?", [&session_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_query_err)?;
    if exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: format!("unknown session {}", session_id),
            details: None,
        });
    }

    let tx = conn.transaction().map_err(db_update_err)?;
    tx.execute("DELETE FROM assessments WHERE session_id = ?", [&session_id])
        .map_err(db_update_err)?;
    tx.execute(
        "DELETE FROM session_assignments WHERE session_id = ?",
        [&session_id],
    )
    .map_err(db_update_err)?;
    tx.execute("DELETE FROM sessions WHERE id = ?", [&session_id])
        .map_err(db_update_err)?;
    tx.commit().map_err(db_commit_err)?;

    Ok(json!({ "deleted": true }))
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match sessions_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match sessions_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match sessions_delete(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sessions.create" => Some(handle_create(state, req)),
        "sessions.list" => Some(handle_list(state, req)),
        "sessions.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
