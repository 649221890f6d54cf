use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::leveling::board::PlacementBoard;
use crate::leveling::config::LevelingConfig;
use crate::leveling::metrics::is_known_metric;
use crate::leveling::store::{LevelingStore, SqliteStore};
use crate::leveling::workflow::{self, Boards, MeetingSource};
use crate::leveling::{AnecdotalRating, LevelingError, Phase, Recommendation};
use rusqlite::Connection;
use serde_json::json;
use std::collections::BTreeMap;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn bad_params(message: impl Into<String>) -> Self {
        Self {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<LevelingError> for HandlerErr {
    fn from(e: LevelingError) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
            details: None,
        }
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn load_config(conn: &Connection) -> Result<LevelingConfig, HandlerErr> {
    LevelingConfig::load(conn).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn board_json(board: &PlacementBoard) -> serde_json::Value {
    json!({
        "studentCount": board.len(),
        "overriddenCount": board.overridden_count(),
        "unsavedChanges": board.has_unsaved_changes(),
        "missingStudentIds": board.missing_student_ids(),
        "entries": board.entries(),
    })
}

fn level_tests_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let grade = params
        .get("grade")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params("missing grade"))?;
    let academic_year = get_required_str(params, "academicYear")?;
    let semester = match params.get("semester") {
        None => 1,
        Some(v) if v.is_null() => 1,
        Some(v) => v
            .as_i64()
            .filter(|n| (1..=4).contains(n))
            .ok_or_else(|| HandlerErr::bad_params("semester must be an integer in 1..=4"))?,
    };
    let created_by = get_optional_str(params, "createdBy");
    let store = SqliteStore::new(conn);
    let test = workflow::create_level_test(
        &store,
        grade,
        &academic_year,
        semester,
        created_by.as_deref(),
    )?;
    Ok(json!({ "levelTest": test }))
}

fn level_tests_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let grade = params.get("grade").and_then(|v| v.as_i64());
    let tests = SqliteStore::new(conn)
        .list_level_tests(grade)
        .map_err(LevelingError::from)?;
    Ok(json!({ "levelTests": tests }))
}

fn level_tests_get(
    conn: &Connection,
    boards: &Boards,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let test_id = get_required_str(params, "testId")?;
    let store = SqliteStore::new(conn);
    let test = workflow::load_level_test(&store, &test_id)?;
    let scores = store.score_records(&test_id).map_err(LevelingError::from)?;
    let ratings = store.anecdotal_ratings(&test_id).map_err(LevelingError::from)?;
    let placements = store.placements(&test_id).map_err(LevelingError::from)?;
    let cohort = store.cohort(test.grade).map_err(LevelingError::from)?;
    Ok(json!({
        "levelTest": test,
        "cohortSize": cohort.len(),
        "scoreCount": scores.len(),
        "anecdotalCount": ratings.len(),
        "savedPlacementCount": placements.len(),
        "meetingOpen": boards.contains_key(&test_id)
    }))
}

fn level_tests_set_phase(
    conn: &Connection,
    boards: &mut Boards,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let test_id = get_required_str(params, "testId")?;
    let phase_raw = get_required_str(params, "phase")?;
    let phase = Phase::parse(&phase_raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown phase: {}", phase_raw)))?;
    let store = SqliteStore::new(conn);

    if phase == Phase::Meeting {
        let config = load_config(conn)?;
        let source = workflow::open_meeting(&store, boards, &test_id, &config)?;
        let test = workflow::load_level_test(&store, &test_id)?;
        let board = boards
            .get(&test_id)
            .map(board_json)
            .unwrap_or_else(|| json!(null));
        return Ok(json!({
            "levelTest": test,
            "source": source,
            "board": board
        }));
    }

    let test = workflow::set_phase(&store, &test_id, phase)?;
    Ok(json!({ "levelTest": test }))
}

fn level_tests_placements_get(
    conn: &Connection,
    boards: &Boards,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let test_id = get_required_str(params, "testId")?;
    let store = SqliteStore::new(conn);
    let test = workflow::load_level_test(&store, &test_id)?;
    if let Some(board) = boards.get(&test_id) {
        if let Some(student_id) = get_optional_str(params, "studentId") {
            let entry = board
                .get(&student_id)
                .ok_or_else(|| LevelingError::NotFound(format!("student {} on board", student_id)))?;
            return Ok(json!({ "levelTest": test, "source": MeetingSource::Memory, "entry": entry }));
        }
        return Ok(json!({
            "levelTest": test,
            "source": MeetingSource::Memory,
            "board": board_json(board)
        }));
    }
    let saved = store.placements(&test_id).map_err(LevelingError::from)?;
    Ok(json!({
        "levelTest": test,
        "source": MeetingSource::Saved,
        "placements": saved
    }))
}

fn level_tests_reassign(
    conn: &Connection,
    boards: &mut Boards,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let test_id = get_required_str(params, "testId")?;
    let student_id = get_required_str(params, "studentId")?;
    let section = get_required_str(params, "section")?;
    let config = load_config(conn)?;
    let store = SqliteStore::new(conn);
    let entry = workflow::reassign(&store, boards, &test_id, &student_id, &section, &config)?;
    Ok(json!({ "entry": entry }))
}

fn level_tests_placements_save(
    conn: &Connection,
    boards: &mut Boards,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let test_id = get_required_str(params, "testId")?;
    let operator_id = get_optional_str(params, "operatorId");
    let store = SqliteStore::new(conn);
    let outcome = workflow::save_placements(&store, boards, &test_id, operator_id.as_deref())?;
    Ok(json!({
        "ok": outcome.errors == 0,
        "saved": outcome.saved,
        "errors": outcome.errors,
        "failedStudentIds": outcome.failed_student_ids,
        "message": outcome.message()
    }))
}

fn level_tests_finalize(
    conn: &Connection,
    boards: &mut Boards,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let test_id = get_required_str(params, "testId")?;
    let operator_id = get_optional_str(params, "operatorId");
    let confirm = params
        .get("confirm")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let store = SqliteStore::new(conn);
    let outcome = workflow::finalize(&store, boards, &test_id, operator_id.as_deref(), confirm)?;
    let errors = outcome.error_count();
    let message = if errors == 0 {
        "finalized".to_string()
    } else {
        format!("finalized with {} error(s)", errors)
    };
    Ok(json!({
        "ok": errors == 0,
        "levelTest": outcome.level_test,
        "placements": outcome.placements,
        "roster": outcome.roster,
        "unplacedStudentIds": outcome.unplaced_student_ids,
        "errors": errors,
        "message": message
    }))
}

fn level_tests_scores_upsert(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let test_id = get_required_str(params, "testId")?;
    let student_id = get_required_str(params, "studentId")?;
    let Some(scores_obj) = params.get("scores").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("scores must be an object"));
    };
    let mut scores: BTreeMap<String, f64> = BTreeMap::new();
    let mut unknown: Vec<String> = Vec::new();
    for (metric, v) in scores_obj {
        if v.is_null() {
            continue;
        }
        let Some(n) = v.as_f64().filter(|n| n.is_finite() && *n >= 0.0) else {
            return Err(HandlerErr::bad_params(format!(
                "scores.{} must be a non-negative number or null",
                metric
            )));
        };
        if !is_known_metric(metric) {
            unknown.push(metric.clone());
        }
        scores.insert(metric.clone(), n);
    }
    let store = SqliteStore::new(conn);
    let record = workflow::record_scores(&store, &test_id, &student_id, scores)?;
    Ok(json!({ "ok": true, "record": record, "unscoredMetrics": unknown }))
}

fn level_tests_scores_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let test_id = get_required_str(params, "testId")?;
    let store = SqliteStore::new(conn);
    workflow::load_level_test(&store, &test_id)?;
    let records = store.score_records(&test_id).map_err(LevelingError::from)?;
    Ok(json!({ "records": records }))
}

fn parse_rating(ratings: &serde_json::Map<String, serde_json::Value>, key: &str) -> Result<i64, HandlerErr> {
    ratings
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("ratings.{} must be an integer", key)))
}

fn level_tests_anecdotal_upsert(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let test_id = get_required_str(params, "testId")?;
    let student_id = get_required_str(params, "studentId")?;
    let Some(ratings) = params.get("ratings").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("ratings must be an object"));
    };
    let recommendation = match params.get("recommendation").and_then(|v| v.as_str()) {
        None => Recommendation::Keep,
        Some(s) => Recommendation::parse(s)
            .ok_or_else(|| HandlerErr::bad_params(format!("unknown recommendation: {}", s)))?,
    };
    let rating = AnecdotalRating {
        level_test_id: test_id,
        student_id,
        participation: parse_rating(ratings, "participation")?,
        work_habits: parse_rating(ratings, "workHabits")?,
        comprehension: parse_rating(ratings, "comprehension")?,
        communication: parse_rating(ratings, "communication")?,
        notes: params
            .get("notes")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        watchlist: params
            .get("watchlist")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        recommendation,
        rater_id: get_optional_str(params, "raterId"),
    };
    let store = SqliteStore::new(conn);
    workflow::record_anecdotal(&store, &rating)?;
    Ok(json!({ "ok": true, "rating": rating }))
}

fn level_tests_anecdotal_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let test_id = get_required_str(params, "testId")?;
    let store = SqliteStore::new(conn);
    workflow::load_level_test(&store, &test_id)?;
    let ratings = store.anecdotal_ratings(&test_id).map_err(LevelingError::from)?;
    Ok(json!({ "ratings": ratings }))
}

fn respond(req: &Request, result: Result<serde_json::Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(error) => {
            tracing::debug!(method = %req.method, code = error.code, message = %error.message, "request failed");
            error.response(&req.id)
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let method = req.method.as_str();
    if !method.starts_with("levelTests.") {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let boards = &mut state.boards;
    let p = &req.params;
    let result = match method {
        "levelTests.create" => level_tests_create(conn, p),
        "levelTests.list" => level_tests_list(conn, p),
        "levelTests.get" => level_tests_get(conn, boards, p),
        "levelTests.setPhase" => level_tests_set_phase(conn, boards, p),
        "levelTests.placementsGet" => level_tests_placements_get(conn, boards, p),
        "levelTests.reassign" => level_tests_reassign(conn, boards, p),
        "levelTests.placementsSave" => level_tests_placements_save(conn, boards, p),
        "levelTests.finalize" => level_tests_finalize(conn, boards, p),
        "levelTests.scoresUpsert" => level_tests_scores_upsert(conn, p),
        "levelTests.scoresList" => level_tests_scores_list(conn, p),
        "levelTests.anecdotalUpsert" => level_tests_anecdotal_upsert(conn, p),
        "levelTests.anecdotalList" => level_tests_anecdotal_list(conn, p),
        _ => return None,
    };
    Some(respond(req, result))
}
