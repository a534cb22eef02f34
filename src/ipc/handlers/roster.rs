use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;

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

fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn get_active_flag(params: &serde_json::Value) -> i64 {
    match params.get("active").and_then(|v| v.as_bool()) {
        Some(false) => 0,
        _ => 1,
    }
}

fn now_stamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn roster_sync_students(
    conn: &mut Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let Some(entries) = params.get("students").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing students array".to_string(),
            details: None,
        });
    };

    let tx = conn.transaction().map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: None,
    })?;

    let stamp = now_stamp();
    let mut upserted = 0usize;
    for (i, entry) in entries.iter().enumerate() {
        let application_number = get_required_str(entry, "applicationNumber").map_err(|_| {
            HandlerErr {
                code: "bad_params",
                message: format!("students[{}] missing applicationNumber", i),
                details: None,
            }
        })?;
        let name = get_required_str(entry, "name")?;
        let branch = get_required_str(entry, "branch")?;
        let batch = get_required_str(entry, "batch")?;
        let email = get_optional_str(entry, "email");
        let phone = get_optional_str(entry, "phone");
        let active = get_active_flag(entry);

        // Roster is canonical for identity and contact fields only; the
        // allocator owns cluster_id/set_type and they are never written here.
        tx.execute(
            "INSERT INTO students(application_number, name, branch, batch, email, phone, active, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(application_number) DO UPDATE SET
               name = excluded.name,
               branch = excluded.branch,
               batch = excluded.batch,
               email = excluded.email,
               phone = excluded.phone,
               active = excluded.active,
               updated_at = excluded.updated_at",
            (
                &application_number,
                &name,
                &branch,
                &batch,
                &email,
                &phone,
                active,
                &stamp,
            ),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
        upserted += 1;
    }

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(json!({ "upserted": upserted }))
}

fn roster_sync_teachers(
    conn: &mut Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let Some(entries) = params.get("teachers").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing teachers array".to_string(),
            details: None,
        });
    };

    let tx = conn.transaction().map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: None,
    })?;

    let mut upserted = 0usize;
    for (i, entry) in entries.iter().enumerate() {
        let teacher_id = get_required_str(entry, "teacherId").map_err(|_| HandlerErr {
            code: "bad_params",
            message: format!("teachers[{}] missing teacherId", i),
            details: None,
        })?;
        let name = get_required_str(entry, "name")?;
        let branch = get_required_str(entry, "branch")?;
        let role = get_required_str(entry, "role")?;
        let active = get_active_flag(entry);

        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM teachers WHERE teacher_id = ?",
                [&teacher_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?;

        if exists.is_some() {
            tx.execute(
                "UPDATE teachers SET name = ?, branch = ?, role = ?, active = ? WHERE teacher_id = ?",
                (&name, &branch, &role, active, &teacher_id),
            )
            .map_err(|e| HandlerErr {
                code: "db_update_failed",
                message: e.to_string(),
                details: None,
            })?;
        } else {
            // sort_order is assigned once at first sight and never rewritten,
            // so the round-robin iteration order stays stable across syncs.
            let next_sort: i64 = tx
                .query_row(
                    "SELECT COALESCE(MAX(sort_order), 0) + 1 FROM teachers",
                    [],
                    |r| r.get(0),
                )
                .map_err(|e| HandlerErr {
                    code: "db_query_failed",
                    message: e.to_string(),
                    details: None,
                })?;
            tx.execute(
                "INSERT INTO teachers(teacher_id, name, branch, role, active, sort_order)
                 VALUES(?, ?, ?, ?, ?, ?)",
                (&teacher_id, &name, &branch, &role, active, next_sort),
            )
            .map_err(|e| HandlerErr {
                code: "db_update_failed",
                message: e.to_string(),
                details: None,
            })?;
        }
        upserted += 1;
    }

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(json!({ "upserted": upserted }))
}

fn roster_list_students(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut sql = String::from(
        "SELECT application_number, name, branch, batch, email, phone, active, cluster_id, set_type
         FROM students WHERE 1=1",
    );
    let mut args: Vec<Value> = Vec::new();
    if let Some(branch) = get_optional_str(params, "branch") {
        sql.push_str(" AND branch = ?");
        args.push(Value::Text(branch));
    }
    if let Some(batch) = get_optional_str(params, "batch") {
        sql.push_str(" AND batch = ?");
        args.push(Value::Text(batch));
    }
    if params.get("activeOnly").and_then(|v| v.as_bool()) == Some(true) {
        sql.push_str(" AND active = 1");
    }
    sql.push_str(" ORDER BY application_number");

    let mut stmt = conn.prepare(&sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let students = stmt
        .query_map(params_from_iter(args), |r| {
            Ok(json!({
                "applicationNumber": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "branch": r.get::<_, String>(2)?,
                "batch": r.get::<_, String>(3)?,
                "email": r.get::<_, Option<String>>(4)?,
                "phone": r.get::<_, Option<String>>(5)?,
                "active": r.get::<_, i64>(6)? != 0,
                "clusterId": r.get::<_, Option<String>>(7)?,
                "setType": r.get::<_, Option<String>>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "students": students }))
}

fn roster_list_teachers(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut sql = String::from(
        "SELECT teacher_id, name, branch, role, active, sort_order FROM teachers WHERE 1=1",
    );
    let mut args: Vec<Value> = Vec::new();
    if let Some(branch) = get_optional_str(params, "branch") {
        sql.push_str(" AND branch = ?");
        args.push(Value::Text(branch));
    }
    sql.push_str(" ORDER BY sort_order, teacher_id");

    let mut stmt = conn.prepare(&sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let teachers = stmt
        .query_map(params_from_iter(args), |r| {
            Ok(json!({
                "teacherId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "branch": r.get::<_, String>(2)?,
                "role": r.get::<_, String>(3)?,
                "active": r.get::<_, i64>(4)? != 0,
                "sortOrder": r.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "teachers": teachers }))
}

fn handle_sync_students(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match roster_sync_students(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_sync_teachers(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match roster_sync_teachers(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_list_students(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match roster_list_students(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_list_teachers(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match roster_list_teachers(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "roster.syncStudents" => Some(handle_sync_students(state, req)),
        "roster.syncTeachers" => Some(handle_sync_teachers(state, req)),
        "roster.listStudents" => Some(handle_list_students(state, req)),
        "roster.listTeachers" => Some(handle_list_teachers(state, req)),
        _ => None,
    }
}
