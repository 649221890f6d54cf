use crate::backup::{self, OpenCycle};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::leveling::store::{LevelingStore, SqliteStore};
use serde_json::json;
use std::path::PathBuf;

fn required_path(req: &Request, key: &str) -> Option<PathBuf> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

/// Boards whose placements exist only in memory.
fn unsaved_board_ids(state: &AppState) -> Vec<String> {
    let mut ids: Vec<String> = state
        .boards
        .values()
        .filter(|b| b.has_unsaved_changes())
        .map(|b| b.level_test_id.clone())
        .collect();
    ids.sort();
    ids
}

fn handle_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(out_path) = required_path(req, "outPath") else {
        return err(&req.id, "bad_params", "missing outPath", None);
    };
    let (Some(workspace), Some(conn)) = (state.workspace.as_ref(), state.db.as_ref()) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let open: Vec<OpenCycle> = match SqliteStore::new(conn).list_level_tests(None) {
        Ok(tests) => tests
            .iter()
            .filter(|t| !t.status.is_terminal())
            .map(OpenCycle::from)
            .collect(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let manifest = match backup::export_bundle(workspace, &out_path, open) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                format!("{e:#}"),
                Some(json!({ "path": out_path.to_string_lossy() })),
            )
        }
    };
    // The bundle only holds what is persisted.
    let unsaved = unsaved_board_ids(state);
    if !unsaved.is_empty() {
        tracing::warn!(boards = unsaved.len(), "exported while placement boards have unsaved changes");
    }
    tracing::info!(
        path = %out_path.display(),
        open_level_tests = manifest.open_level_tests.len(),
        "workspace bundle exported"
    );
    ok(
        &req.id,
        json!({
            "path": out_path.to_string_lossy(),
            "manifest": manifest,
            "unsavedBoardIds": unsaved
        }),
    )
}

fn handle_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(in_path) = required_path(req, "inPath") else {
        return err(&req.id, "bad_params", "missing inPath", None);
    };
    let target = required_path(req, "workspacePath").or_else(|| state.workspace.clone());
    let Some(target) = target else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    // Restoring would silently discard overrides that were never saved.
    let unsaved = unsaved_board_ids(state);
    if !unsaved.is_empty() {
        return err(
            &req.id,
            "conflict",
            "save or finalize open placement boards before importing",
            Some(json!({ "levelTestIds": unsaved })),
        );
    }

    let bundle = match backup::read_bundle(&in_path) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "bad_bundle",
                format!("{e:#}"),
                Some(json!({ "path": in_path.to_string_lossy() })),
            )
        }
    };

    // The bundle checked out; only now release the live workspace.
    state.db = None;
    state.boards.clear();
    if let Err(e) = bundle.restore_into(&target) {
        tracing::error!(workspace = %target.display(), error = %e, "bundle restore failed");
        return err(&req.id, "io_failed", format!("{e:#}"), None);
    }
    match db::open_db(&target) {
        Ok(conn) => {
            tracing::info!(
                workspace = %target.display(),
                open_level_tests = bundle.manifest.open_level_tests.len(),
                "workspace restored from bundle"
            );
            state.workspace = Some(target.clone());
            state.db = Some(conn);
            ok(
                &req.id,
                json!({
                    "workspacePath": target.to_string_lossy(),
                    "exportedAt": bundle.manifest.exported_at,
                    "openLevelTests": bundle.manifest.open_level_tests
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_export(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_import(state, req)),
        _ => None,
    }
}
