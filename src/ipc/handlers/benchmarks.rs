use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::leveling::store::{LevelingStore, SqliteStore};
use serde_json::json;
use std::collections::BTreeMap;

fn handle_benchmarks_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(grade) = req.params.get("grade").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing grade", None);
    };
    let reg = match SqliteStore::new(conn).benchmarks(grade) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows: Vec<serde_json::Value> = reg
        .sections()
        .into_iter()
        .map(|section| {
            json!({
                "section": section,
                "targets": reg.row(section).cloned().unwrap_or_default()
            })
        })
        .collect();
    ok(&req.id, json!({ "grade": reg.grade, "benchmarks": rows }))
}

fn handle_benchmarks_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(grade) = req.params.get("grade").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing grade", None);
    };
    let section = match req.params.get("section").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing section", None),
    };
    let Some(targets_obj) = req.params.get("targets").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "targets must be an object", None);
    };

    let mut targets: BTreeMap<String, f64> = BTreeMap::new();
    for (metric, v) in targets_obj {
        let Some(n) = v.as_f64().filter(|n| n.is_finite() && *n > 0.0) else {
            return err(
                &req.id,
                "bad_params",
                format!("targets.{} must be a positive number", metric),
                None,
            );
        };
        targets.insert(metric.clone(), n);
    }

    if let Err(e) = SqliteStore::new(conn).replace_benchmarks(grade, &section, &targets) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({ "ok": true, "grade": grade, "section": section, "targets": targets }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "benchmarks.list" => Some(handle_benchmarks_list(state, req)),
        "benchmarks.upsert" => Some(handle_benchmarks_upsert(state, req)),
        _ => None,
    }
}
