use crate::alloc::{self, ClusterLoad};
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

fn get_required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
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

fn no_cluster_err(branch: &str, batch: &str) -> HandlerErr {
    HandlerErr {
        code: "no_cluster",
        message: format!(
            "no clusters exist for {}/{}; call clusters.ensure first",
            branch, batch
        ),
        details: None,
    }
}

fn load_cluster_counters(
    conn: &Connection,
    branch: &str,
    batch: &str,
) -> Result<Vec<ClusterLoad>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT cluster_id, student_count, set_a, set_b, created_seq
             FROM clusters
             WHERE branch = ? AND batch = ?
             ORDER BY created_seq",
        )
        .map_err(db_query_err)?;
    stmt.query_map((branch, batch), |r| {
        Ok(ClusterLoad {
            cluster_id: r.get(0)?,
            student_count: r.get(1)?,
            set_a: r.get(2)?,
            set_b: r.get(3)?,
            created_seq: r.get(4)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_query_err)
}

fn cluster_row_json(conn: &Connection, cluster_id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        "SELECT cluster_id, branch, batch, cluster_type, set_a, set_b, student_count
         FROM clusters WHERE cluster_id = ?",
        [cluster_id],
        |r| {
            Ok(json!({
                "clusterId": r.get::<_, String>(0)?,
                "branch": r.get::<_, String>(1)?,
                "batch": r.get::<_, String>(2)?,
                "clusterType": r.get::<_, String>(3)?,
                "setA": r.get::<_, i64>(4)?,
                "setB": r.get::<_, i64>(5)?,
                "studentCount": r.get::<_, i64>(6)?,
            }))
        },
    )
    .map_err(db_query_err)
}

/// Relative increments keyed by cluster_id. Counter mutations never go through
/// a read-then-write of the stored values.
fn bump_cluster_for_intake(
    conn: &Connection,
    cluster_id: &str,
    set_type: &str,
) -> Result<(), HandlerErr> {
    let sql = if set_type == "A" {
        "UPDATE clusters SET student_count = student_count + 1, set_a = set_a + 1 WHERE cluster_id = ?"
    } else {
        "UPDATE clusters SET student_count = student_count + 1, set_b = set_b + 1 WHERE cluster_id = ?"
    };
    conn.execute(sql, [cluster_id]).map_err(db_update_err)?;
    Ok(())
}

fn stamp_student(
    conn: &Connection,
    application_number: &str,
    cluster_id: &str,
    set_type: &str,
) -> Result<(), HandlerErr> {
    let stamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    conn.execute(
        "UPDATE students SET cluster_id = ?, set_type = ?, updated_at = ? WHERE application_number = ?",
        (cluster_id, set_type, &stamp, application_number),
    )
    .map_err(db_update_err)?;
    Ok(())
}

fn clusters_ensure(
    conn: &mut Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let branch = get_required_str(params, "branch")?;
    let batch = get_required_str(params, "batch")?;
    let target_count = get_required_i64(params, "targetCount")?;
    if target_count < 1 {
        return Err(HandlerErr {
            code: "configuration",
            message: format!("targetCount must be at least 1, got {}", target_count),
            details: None,
        });
    }

    let existing: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM clusters WHERE branch = ? AND batch = ?",
            (&branch, &batch),
            |r| r.get(0),
        )
        .map_err(db_query_err)?;

    let created = if existing > 0 {
        // Idempotent: an existing cluster set is never resized.
        false
    } else {
        let tx = conn.transaction().map_err(db_update_err)?;
        for i in 1..=target_count {
            tx.execute(
                "INSERT INTO clusters(cluster_id, branch, batch, cluster_type, set_a, set_b, student_count, created_seq)
                 VALUES(?, ?, ?, ?, 0, 0, 0, ?)",
                (
                    alloc::cluster_id_for(&branch, &batch, i),
                    &branch,
                    &batch,
                    alloc::cluster_type_for(i),
                    i,
                ),
            )
            .map_err(db_update_err)?;
        }
        tx.commit().map_err(db_commit_err)?;
        true
    };

    let loads = load_cluster_counters(conn, &branch, &batch)?;
    let mut clusters = Vec::with_capacity(loads.len());
    for load in &loads {
        clusters.push(cluster_row_json(conn, &load.cluster_id)?);
    }
    Ok(json!({ "created": created, "clusters": clusters }))
}

fn clusters_assign_student(
    conn: &mut Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let application_number = get_required_str(params, "applicationNumber")?;

    let row: Option<(String, String, Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT branch, batch, cluster_id, set_type FROM students WHERE application_number = ?",
            [&application_number],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(db_query_err)?;
    let Some((branch, batch, cluster_id, set_type)) = row else {
        return Err(HandlerErr {
            code: "not_found",
            message: format!("unknown student {}", application_number),
            details: None,
        });
    };

    // Documented no-op: intake assigns exactly once; only clusters.rebalance
    // moves a student afterwards.
    if let (Some(cluster_id), Some(set_type)) = (cluster_id, set_type) {
        return Ok(json!({
            "clusterId": cluster_id,
            "setType": set_type,
            "alreadyAssigned": true
        }));
    }

    let tx = conn.transaction().map_err(db_update_err)?;
    let loads = load_cluster_counters(&tx, &branch, &batch)?;
    let Some(picked) = alloc::pick_cluster(&loads) else {
        return Err(no_cluster_err(&branch, &batch));
    };
    let chosen_cluster = picked.cluster_id.clone();
    let chosen_set = alloc::pick_set(picked.set_a, picked.set_b);

    bump_cluster_for_intake(&tx, &chosen_cluster, chosen_set)?;
    stamp_student(&tx, &application_number, &chosen_cluster, chosen_set)?;
    tx.commit().map_err(db_commit_err)?;

    Ok(json!({
        "clusterId": chosen_cluster,
        "setType": chosen_set,
        "alreadyAssigned": false
    }))
}

fn clusters_assign_set(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let cluster_id = get_required_str(params, "clusterId")?;

    let counters: Option<(i64, i64)> = conn
        .query_row(
            "SELECT set_a, set_b FROM clusters WHERE cluster_id = ?",
            [&cluster_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_query_err)?;
    let Some((set_a, set_b)) = counters else {
        return Err(HandlerErr {
            code: "not_found",
            message: format!("unknown cluster {}", cluster_id),
            details: None,
        });
    };

    let chosen = alloc::pick_set(set_a, set_b);
    let sql = if chosen == "A" {
        "UPDATE clusters SET set_a = set_a + 1 WHERE cluster_id = ?"
    } else {
        "UPDATE clusters SET set_b = set_b + 1 WHERE cluster_id = ?"
    };
    conn.execute(sql, [&cluster_id]).map_err(db_update_err)?;

    Ok(json!({ "setType": chosen }))
}

fn assign_unassigned_in_tx(
    tx: &Connection,
    loads: &mut [ClusterLoad],
    branch: &str,
    batch: &str,
    only_unassigned: bool,
) -> Result<i64, HandlerErr> {
    let sql = if only_unassigned {
        "SELECT application_number FROM students
         WHERE branch = ? AND batch = ? AND active = 1 AND cluster_id IS NULL
         ORDER BY application_number"
    } else {
        "SELECT application_number FROM students
         WHERE branch = ? AND batch = ? AND active = 1
         ORDER BY application_number"
    };
    let mut stmt = tx.prepare(sql).map_err(db_query_err)?;
    let students = stmt
        .query_map((branch, batch), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;

    let mut assigned = 0i64;
    for application_number in students {
        let idx = {
            let picked = alloc::pick_cluster(loads).ok_or_else(|| no_cluster_err(branch, batch))?;
            loads
                .iter()
                .position(|c| c.cluster_id == picked.cluster_id)
                .ok_or_else(|| no_cluster_err(branch, batch))?
        };
        let chosen_set = alloc::pick_set(loads[idx].set_a, loads[idx].set_b);
        let chosen_cluster = loads[idx].cluster_id.clone();

        bump_cluster_for_intake(tx, &chosen_cluster, chosen_set)?;
        stamp_student(tx, &application_number, &chosen_cluster, chosen_set)?;

        loads[idx].student_count += 1;
        if chosen_set == "A" {
            loads[idx].set_a += 1;
        } else {
            loads[idx].set_b += 1;
        }
        assigned += 1;
    }
    Ok(assigned)
}

fn clusters_assign_all(
    conn: &mut Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let branch = get_required_str(params, "branch")?;
    let batch = get_required_str(params, "batch")?;

    let tx = conn.transaction().map_err(db_update_err)?;
    let mut loads = load_cluster_counters(&tx, &branch, &batch)?;
    if loads.is_empty() {
        return Err(no_cluster_err(&branch, &batch));
    }
    let assigned = assign_unassigned_in_tx(&tx, &mut loads, &branch, &batch, true)?;
    tx.commit().map_err(db_commit_err)?;

    let clusters = loads
        .iter()
        .map(|c| {
            json!({
                "clusterId": c.cluster_id,
                "studentCount": c.student_count,
                "setA": c.set_a,
                "setB": c.set_b,
            })
        })
        .collect::<Vec<_>>();
    Ok(json!({ "assigned": assigned, "clusters": clusters }))
}

fn clusters_rebalance(
    conn: &mut Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let branch = get_required_str(params, "branch")?;
    let batch = get_required_str(params, "batch")?;

    let tx = conn.transaction().map_err(db_update_err)?;
    let mut loads = load_cluster_counters(&tx, &branch, &batch)?;
    if loads.is_empty() {
        return Err(no_cluster_err(&branch, &batch));
    }

    tx.execute(
        "UPDATE students SET cluster_id = NULL, set_type = NULL WHERE branch = ? AND batch = ?",
        (&branch, &batch),
    )
    .map_err(db_update_err)?;
    tx.execute(
        "UPDATE clusters SET set_a = 0, set_b = 0, student_count = 0 WHERE branch = ? AND batch = ?",
        (&branch, &batch),
    )
    .map_err(db_update_err)?;
    for load in loads.iter_mut() {
        load.student_count = 0;
        load.set_a = 0;
        load.set_b = 0;
    }

    let assigned = assign_unassigned_in_tx(&tx, &mut loads, &branch, &batch, false)?;
    tx.commit().map_err(db_commit_err)?;

    let clusters = loads
        .iter()
        .map(|c| {
            json!({
                "clusterId": c.cluster_id,
                "studentCount": c.student_count,
                "setA": c.set_a,
                "setB": c.set_b,
            })
        })
        .collect::<Vec<_>>();
    Ok(json!({ "assigned": assigned, "clusters": clusters }))
}

fn clusters_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut sql = String::from(
        "SELECT cluster_id, branch, batch, cluster_type, set_a, set_b, student_count
         FROM clusters WHERE 1=1",
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
    sql.push_str(" ORDER BY branch, batch, created_seq");

    let mut stmt = conn.prepare(&sql).map_err(db_query_err)?;
    let clusters = stmt
        .query_map(params_from_iter(args), |r| {
            Ok(json!({
                "clusterId": r.get::<_, String>(0)?,
                "branch": r.get::<_, String>(1)?,
                "batch": r.get::<_, String>(2)?,
                "clusterType": r.get::<_, String>(3)?,
                "setA": r.get::<_, i64>(4)?,
                "setB": r.get::<_, i64>(5)?,
                "studentCount": r.get::<_, i64>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;

    Ok(json!({ "clusters": clusters }))
}

fn handle_ensure(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match clusters_ensure(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_assign_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match clusters_assign_student(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_assign_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match clusters_assign_set(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_assign_all(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match clusters_assign_all(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_rebalance(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match clusters_rebalance(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match clusters_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "clusters.ensure" => Some(handle_ensure(state, req)),
        "clusters.assignStudent" => Some(handle_assign_student(state, req)),
        "clusters.assignSet" => Some(handle_assign_set(state, req)),
        "clusters.assignAll" => Some(handle_assign_all(state, req)),
        "clusters.rebalance" => Some(handle_rebalance(state, req)),
        "clusters.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
