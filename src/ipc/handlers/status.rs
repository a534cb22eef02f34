use crate::alloc;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
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

/// `asOf` is injectable so views are reproducible; defaults to today.
fn as_of_date(params: &serde_json::Value) -> Result<String, HandlerErr> {
    match params.get("asOf").and_then(|v| v.as_str()) {
        Some(raw) => {
            let parsed = alloc::parse_start_date(raw).map_err(|e| HandlerErr {
                code: "bad_params",
                message: e.message,
                details: None,
            })?;
            Ok(parsed.format("%Y-%m-%d").to_string())
        }
        None => Ok(chrono::Utc::now().format("%Y-%m-%d").to_string()),
    }
}

fn teacher_sessions(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let as_of = as_of_date(params)?;

    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM teachers WHERE teacher_id = ?",
            [&teacher_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query_err)?;
    if exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: format!("unknown teacher {}", teacher_id),
            details: None,
        });
    }

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.branch, s.batch, s.period, s.start_date, s.end_date,
                    a.cluster_id, a.set_type, a.status
             FROM session_assignments a
             JOIN sessions s ON s.id = a.session_id
             WHERE a.teacher_id = ?
             ORDER BY s.start_date",
        )
        .map_err(db_query_err)?;
    let rows = stmt
        .query_map([&teacher_id], |r| {
            Ok((
                r.get::<_, String>(4)?,
                r.get::<_, String>(8)?,
                json!({
                    "sessionId": r.get::<_, String>(0)?,
                    "branch": r.get::<_, String>(1)?,
                    "batch": r.get::<_, String>(2)?,
                    "period": r.get::<_, String>(3)?,
                    "startDate": r.get::<_, String>(4)?,
                    "endDate": r.get::<_, String>(5)?,
                    "clusterId": r.get::<_, String>(6)?,
                    "setType": r.get::<_, String>(7)?,
                    "status": r.get::<_, String>(8)?,
                }),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;

    // Exactly one bucket per assignment: upcoming wins over status, completed
    // over pending; incomplete assignments stay visible in pending.
    let mut pending = Vec::new();
    let mut completed = Vec::new();
    let mut upcoming = Vec::new();
    for (start_date, status, entry) in rows {
        if start_date.as_str() > as_of.as_str() {
            upcoming.push(entry);
        } else if status == "complete" {
            completed.push(entry);
        } else {
            pending.push(entry);
        }
    }

    Ok(json!({
        "asOf": as_of,
        "pending": pending,
        "completed": completed,
        "upcoming": upcoming,
    }))
}

fn record_assessment(
    conn: &mut Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let teacher_id = get_required_str(params, "teacherId")?;
    let application_number = get_required_str(params, "applicationNumber")?;
    let score = params.get("score").and_then(|v| v.as_f64());
    let remarks = params
        .get("remarks")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let assignment: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT id, cluster_id, set_type, status FROM session_assignments
             WHERE session_id = ? AND teacher_id = ?",
            (&session_id, &teacher_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(db_query_err)?;
    let Some((assignment_id, cluster_id, set_type, status)) = assignment else {
        return Err(HandlerErr {
            code: "not_found",
            message: format!(
                "no assignment for teacher {} in session {}",
                teacher_id, session_id
            ),
            details: None,
        });
    };

    let student: Option<(Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT cluster_id, set_type FROM students WHERE application_number = ?",
            [&application_number],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_query_err)?;
    let Some((student_cluster, student_set)) = student else {
        return Err(HandlerErr {
            code: "not_found",
            message: format!("unknown student {}", application_number),
            details: None,
        });
    };
    if student_cluster.as_deref() != Some(cluster_id.as_str())
        || student_set.as_deref() != Some(set_type.as_str())
    {
        return Err(HandlerErr {
            code: "validation",
            message: format!(
                "student {} is not in the {}/{} subset assigned to teacher {}",
                application_number, cluster_id, set_type, teacher_id
            ),
            details: None,
        });
    }

    let recorded_at = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let tx = conn.transaction().map_err(db_update_err)?;
    tx.execute(
        "INSERT INTO assessments(id, session_id, application_number, teacher_id, score, remarks, recorded_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(session_id, application_number) DO UPDATE SET
           teacher_id = excluded.teacher_id,
           score = excluded.score,
           remarks = excluded.remarks,
           recorded_at = excluded.recorded_at",
        (
            Uuid::new_v4().to_string(),
            &session_id,
            &application_number,
            &teacher_id,
            score,
            &remarks,
            &recorded_at,
        ),
    )
    .map_err(db_update_err)?;

    // All-or-nothing: the assignment completes only when every active student
    // of the assigned cluster-subset has a recorded assessment.
    let subset_size: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM students
             WHERE cluster_id = ? AND set_type = ? AND active = 1",
            (&cluster_id, &set_type),
            |r| r.get(0),
        )
        .map_err(db_query_err)?;
    let assessed: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM students s
             JOIN assessments a
               ON a.application_number = s.application_number AND a.session_id = ?
             WHERE s.cluster_id = ? AND s.set_type = ? AND s.active = 1",
            (&session_id, &cluster_id, &set_type),
            |r| r.get(0),
        )
        .map_err(db_query_err)?;

    let new_status = if subset_size > 0 && assessed >= subset_size {
        "complete"
    } else {
        // Partial coverage never downgrades an explicit incomplete mark.
        if status == "incomplete" {
            "incomplete"
        } else {
            "pending"
        }
    };
    tx.execute(
        "UPDATE session_assignments SET status = ? WHERE id = ?",
        (new_status, &assignment_id),
    )
    .map_err(db_update_err)?;
    tx.commit().map_err(db_commit_err)?;

    Ok(json!({
        "status": new_status,
        "assessedCount": assessed,
        "subsetSize": subset_size,
    }))
}

fn sweep_expired(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let as_of = as_of_date(params)?;
    let marked = conn
        .execute(
            "UPDATE session_assignments SET status = 'incomplete'
             WHERE status = 'pending'
               AND session_id IN (SELECT id FROM sessions WHERE end_date < ?)",
            [&as_of],
        )
        .map_err(db_update_err)?;
    Ok(json!({ "marked": marked }))
}

fn handle_teacher_sessions(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match teacher_sessions(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_record_assessment(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match record_assessment(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_sweep_expired(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match sweep_expired(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "status.teacherSessions" => Some(handle_teacher_sessions(state, req)),
        "status.recordAssessment" => Some(handle_record_assessment(state, req)),
        "status.sweepExpired" => Some(handle_sweep_expired(state, req)),
        _ => None,
    }
}
