//! Phase state machine for a leveling cycle.
//!
//! `setup`, `scores`, `anecdotal` and `meeting` can be visited in any order.
//! `finalized` is only reached through [`finalize`] and is terminal.

use super::board::{save_board, PlacementBoard, PlacementBreakdown, PlacementEntry, SaveOutcome};
use super::composite::{composite_score, ScorerInputs};
use super::config::LevelingConfig;
use super::metrics::BenchmarkRegistry;
use super::ranking::{assign_bin, percentiles};
use super::store::LevelingStore;
use super::{
    now_stamp, AnecdotalRating, ClassroomGrade, LevelTest, LevelingError, Phase, PlacementRecord,
    ScoreRecord, Student,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

/// Open boards keyed by level test id.
pub type Boards = HashMap<String, PlacementBoard>;

pub fn load_level_test(store: &dyn LevelingStore, test_id: &str) -> Result<LevelTest, LevelingError> {
    store
        .level_test(test_id)?
        .ok_or_else(|| LevelingError::NotFound(format!("level test {}", test_id)))
}

fn require_open(test: &LevelTest) -> Result<(), LevelingError> {
    if test.status.is_terminal() {
        return Err(LevelingError::AlreadyFinalized);
    }
    Ok(())
}

pub fn create_level_test(
    store: &dyn LevelingStore,
    grade: i64,
    academic_year: &str,
    semester: i64,
    created_by: Option<&str>,
) -> Result<LevelTest, LevelingError> {
    if store.has_open_level_test(grade, academic_year, semester)? {
        return Err(LevelingError::Conflict(format!(
            "grade {} already has an open level test for {} semester {}",
            grade, academic_year, semester
        )));
    }
    let test = LevelTest {
        id: Uuid::new_v4().to_string(),
        grade,
        academic_year: academic_year.to_string(),
        semester,
        status: Phase::Setup,
        created_by: created_by.map(str::to_string),
        created_at: now_stamp(),
        finalized_at: None,
    };
    store.insert_level_test(&test)?;
    tracing::info!(level_test_id = %test.id, grade, "level test created");
    Ok(test)
}

/// Moves between the pre-finalize phases. Entering `meeting` does not open
/// the board by itself; see [`open_meeting`].
pub fn set_phase(
    store: &dyn LevelingStore,
    test_id: &str,
    phase: Phase,
) -> Result<LevelTest, LevelingError> {
    let mut test = load_level_test(store, test_id)?;
    require_open(&test)?;
    if phase.is_terminal() {
        return Err(LevelingError::BadParams(
            "use finalize to finalize a level test".to_string(),
        ));
    }
    if test.status != phase {
        store.set_level_test_status(test_id, phase, None)?;
        tracing::debug!(level_test_id = %test_id, from = test.status.as_str(), to = phase.as_str(), "phase changed");
        test.status = phase;
    }
    Ok(test)
}

pub fn record_scores(
    store: &dyn LevelingStore,
    test_id: &str,
    student_id: &str,
    scores: BTreeMap<String, f64>,
) -> Result<ScoreRecord, LevelingError> {
    let test = load_level_test(store, test_id)?;
    require_open(&test)?;
    let student = store
        .student(student_id)?
        .ok_or_else(|| LevelingError::NotFound(format!("student {}", student_id)))?;
    if student.grade != test.grade {
        return Err(LevelingError::BadParams(format!(
            "student {} is not in grade {}",
            student_id, test.grade
        )));
    }
    let record = ScoreRecord {
        level_test_id: test_id.to_string(),
        student_id: student_id.to_string(),
        scores,
        previous_section: student.current_section,
    };
    store.upsert_score_record(&record)?;
    Ok(record)
}

pub fn record_anecdotal(
    store: &dyn LevelingStore,
    rating: &AnecdotalRating,
) -> Result<(), LevelingError> {
    let test = load_level_test(store, &rating.level_test_id)?;
    require_open(&test)?;
    for r in rating.ratings() {
        if !(AnecdotalRating::MIN_RATING..=AnecdotalRating::MAX_RATING).contains(&r) {
            return Err(LevelingError::BadParams(format!(
                "ratings must be in {}..={}",
                AnecdotalRating::MIN_RATING,
                AnecdotalRating::MAX_RATING
            )));
        }
    }
    let student = store
        .student(&rating.student_id)?
        .ok_or_else(|| LevelingError::NotFound(format!("student {}", rating.student_id)))?;
    if student.grade != test.grade {
        return Err(LevelingError::BadParams(format!(
            "student {} is not in grade {}",
            rating.student_id, test.grade
        )));
    }
    store.upsert_anecdotal(rating)?;
    Ok(())
}

/// Everything the placement pass reads, captured once.
#[derive(Debug, Clone, Default)]
pub struct CohortSnapshot {
    pub students: Vec<Student>,
    pub benchmarks: BenchmarkRegistry,
    pub scores: HashMap<String, ScoreRecord>,
    pub ratings: HashMap<String, AnecdotalRating>,
    pub grades: HashMap<String, Vec<ClassroomGrade>>,
}

impl CohortSnapshot {
    pub fn load(store: &dyn LevelingStore, test: &LevelTest) -> anyhow::Result<Self> {
        Ok(Self {
            students: store.cohort(test.grade)?,
            benchmarks: store.benchmarks(test.grade)?,
            scores: store
                .score_records(&test.id)?
                .into_iter()
                .map(|r| (r.student_id.clone(), r))
                .collect(),
            ratings: store
                .anecdotal_ratings(&test.id)?
                .into_iter()
                .map(|r| (r.student_id.clone(), r))
                .collect(),
            grades: store.classroom_grades(test.grade)?,
        })
    }
}

/// Composite → percentile → bin for every student in the snapshot. Pure.
pub fn compute_board(test_id: &str, snapshot: &CohortSnapshot, config: &LevelingConfig) -> PlacementBoard {
    let breakdowns: Vec<_> = snapshot
        .students
        .iter()
        .map(|s| {
            let inputs = ScorerInputs {
                scores: snapshot.scores.get(&s.id),
                benchmark: s
                    .current_section
                    .as_deref()
                    .and_then(|sec| snapshot.benchmarks.row(sec)),
                grades: snapshot.grades.get(&s.id).map(Vec::as_slice).unwrap_or(&[]),
                rating: snapshot.ratings.get(&s.id),
            };
            composite_score(&inputs, &config.weights)
        })
        .collect();
    let composites: Vec<f64> = breakdowns.iter().map(|b| b.composite).collect();
    let pcts = percentiles(&composites);

    let entries = snapshot
        .students
        .iter()
        .zip(breakdowns.iter().zip(pcts.iter()))
        .map(|(s, (b, pct))| {
            let scores = snapshot.scores.get(&s.id);
            let bin = assign_bin(*pct, config.section_count(), scores, &config.safety_floor);
            let section = config
                .sections
                .get(bin.index)
                .cloned()
                .unwrap_or_else(|| config.lowest_section().to_string());
            PlacementEntry {
                student_id: s.id.clone(),
                display_name: s.display_name.clone(),
                previous_section: scores
                    .and_then(|r| r.previous_section.clone())
                    .or_else(|| s.current_section.clone()),
                auto_section: section.clone(),
                final_section: section,
                overridden: false,
                overridden_by: None,
                breakdown: Some(PlacementBreakdown {
                    test_ratio: b.test_ratio,
                    grade_ratio: b.grade_ratio,
                    anecdotal_ratio: b.anecdotal_ratio,
                    composite: b.composite,
                    percentile: *pct,
                    bin_index: bin.index,
                    safety_floor: bin.safety_floor,
                }),
            }
        })
        .collect();
    PlacementBoard::computed(test_id, entries)
}

fn board_from_saved(
    store: &dyn LevelingStore,
    test: &LevelTest,
    saved: Vec<PlacementRecord>,
) -> anyhow::Result<PlacementBoard> {
    let cohort = store.cohort(test.grade)?;
    let missing = unplaced_students(&cohort, &saved);
    if !missing.is_empty() {
        tracing::warn!(
            level_test_id = %test.id,
            missing = missing.len(),
            "saved placements do not cover the whole cohort"
        );
    }
    let names: HashMap<String, Student> = cohort
        .into_iter()
        .map(|s| (s.id.clone(), s))
        .collect();
    let previous: HashMap<String, Option<String>> = store
        .score_records(&test.id)?
        .into_iter()
        .map(|r| (r.student_id, r.previous_section))
        .collect();
    let entries = saved
        .into_iter()
        .map(|r| {
            let student = names.get(&r.student_id);
            PlacementEntry {
                display_name: student
                    .map(|s| s.display_name.clone())
                    .unwrap_or_else(|| r.student_id.clone()),
                previous_section: previous
                    .get(&r.student_id)
                    .cloned()
                    .flatten()
                    .or_else(|| student.and_then(|s| s.current_section.clone())),
                overridden: r.final_section != r.auto_section,
                student_id: r.student_id,
                auto_section: r.auto_section,
                final_section: r.final_section,
                overridden_by: r.overridden_by,
                breakdown: None,
            }
        })
        .collect();
    Ok(PlacementBoard::loaded(&test.id, entries, missing))
}

/// Active cohort students, in roster order, that no record places.
fn unplaced_students(cohort: &[Student], records: &[PlacementRecord]) -> Vec<String> {
    let placed: HashSet<&str> = records.iter().map(|r| r.student_id.as_str()).collect();
    cohort
        .iter()
        .filter(|s| !placed.contains(s.id.as_str()))
        .map(|s| s.id.clone())
        .collect()
}

/// Section names may only change while no open cycle has placements. A
/// rename under a live board would leave entries outside the section set.
pub fn ensure_sections_editable(store: &dyn LevelingStore, boards: &Boards) -> Result<(), LevelingError> {
    if let Some(test_id) = boards.keys().next() {
        return Err(LevelingError::Conflict(format!(
            "sections cannot change while level test {} is in its meeting",
            test_id
        )));
    }
    if let Some(test_id) = store.open_tests_with_placements()?.first() {
        return Err(LevelingError::Conflict(format!(
            "sections cannot change while level test {} has saved placements; finalize it first",
            test_id
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingSource {
    /// Board already open in this session.
    Memory,
    /// Loaded verbatim from saved placement records.
    Saved,
    /// Freshly computed; nothing persisted yet.
    Computed,
}

/// Enters the meeting phase. Saved placements are never recomputed, so manual
/// overrides survive re-entry even if scores changed since the save.
pub fn open_meeting(
    store: &dyn LevelingStore,
    boards: &mut Boards,
    test_id: &str,
    config: &LevelingConfig,
) -> Result<MeetingSource, LevelingError> {
    let test = set_phase(store, test_id, Phase::Meeting)?;
    if boards.contains_key(test_id) {
        return Ok(MeetingSource::Memory);
    }
    let saved = store.placements(test_id)?;
    let (board, source) = if saved.is_empty() {
        let snapshot = CohortSnapshot::load(store, &test)?;
        (compute_board(test_id, &snapshot, config), MeetingSource::Computed)
    } else {
        (board_from_saved(store, &test, saved)?, MeetingSource::Saved)
    };
    tracing::info!(
        level_test_id = %test_id,
        source = ?source,
        students = board.len(),
        "meeting opened"
    );
    boards.insert(test_id.to_string(), board);
    Ok(source)
}

pub fn reassign<'b>(
    store: &dyn LevelingStore,
    boards: &'b mut Boards,
    test_id: &str,
    student_id: &str,
    section: &str,
    config: &LevelingConfig,
) -> Result<&'b PlacementEntry, LevelingError> {
    let test = load_level_test(store, test_id)?;
    require_open(&test)?;
    let board = boards.get_mut(test_id).ok_or(LevelingError::MeetingNotOpen)?;
    board.reassign(student_id, section, &config.sections)
}

pub fn save_placements(
    store: &dyn LevelingStore,
    boards: &mut Boards,
    test_id: &str,
    operator_id: Option<&str>,
) -> Result<SaveOutcome, LevelingError> {
    let test = load_level_test(store, test_id)?;
    require_open(&test)?;
    let board = boards.get_mut(test_id).ok_or(LevelingError::MeetingNotOpen)?;
    Ok(save_board(store, board, operator_id))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterOutcome {
    pub updated: usize,
    pub errors: usize,
    pub failed_student_ids: Vec<String>,
}

/// Writes each final section into the roster. Re-running with the same
/// records leaves the roster unchanged.
pub fn apply_roster(store: &dyn LevelingStore, records: &[PlacementRecord]) -> RosterOutcome {
    let mut outcome = RosterOutcome::default();
    for r in records {
        match store.set_current_section(&r.student_id, &r.final_section) {
            Ok(()) => outcome.updated += 1,
            Err(e) => {
                tracing::warn!(student_id = %r.student_id, error = %e, "roster update failed");
                outcome.errors += 1;
                outcome.failed_student_ids.push(r.student_id.clone());
            }
        }
    }
    outcome
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeOutcome {
    pub level_test: LevelTest,
    pub placements: SaveOutcome,
    pub roster: RosterOutcome,
    /// Active students finalized without any placement; their section is
    /// left as it was.
    pub unplaced_student_ids: Vec<String>,
}

impl FinalizeOutcome {
    pub fn error_count(&self) -> usize {
        self.placements.errors + self.roster.errors + self.unplaced_student_ids.len()
    }
}

/// One-way gate: persist placements, apply them to the roster, mark the
/// cycle finalized. Partial failures are counted, not rolled back. Active
/// students without a placement also count as errors.
pub fn finalize(
    store: &dyn LevelingStore,
    boards: &mut Boards,
    test_id: &str,
    operator_id: Option<&str>,
    confirm: bool,
) -> Result<FinalizeOutcome, LevelingError> {
    let mut test = load_level_test(store, test_id)?;
    require_open(&test)?;
    if !confirm {
        return Err(LevelingError::ConfirmationRequired);
    }

    let (placements, records) = match boards.get_mut(test_id) {
        Some(board) if !board.is_empty() => {
            let outcome = save_board(store, board, operator_id);
            (outcome, board.records(operator_id))
        }
        _ => {
            let saved = store.placements(test_id)?;
            if saved.is_empty() {
                return Err(LevelingError::NoPlacements);
            }
            let outcome = SaveOutcome {
                saved: saved.len(),
                ..SaveOutcome::default()
            };
            (outcome, saved)
        }
    };

    let unplaced_student_ids = unplaced_students(&store.cohort(test.grade)?, &records);
    for student_id in &unplaced_student_ids {
        tracing::warn!(level_test_id = %test_id, student_id = %student_id, "student has no placement");
    }
    let roster = apply_roster(store, &records);
    let finalized_at = now_stamp();
    store.set_level_test_status(test_id, Phase::Finalized, Some(&finalized_at))?;
    test.status = Phase::Finalized;
    test.finalized_at = Some(finalized_at);
    boards.remove(test_id);

    let outcome = FinalizeOutcome {
        level_test: test,
        placements,
        roster,
        unplaced_student_ids,
    };
    tracing::info!(
        level_test_id = %test_id,
        students = records.len(),
        errors = outcome.error_count(),
        "level test finalized"
    );
    Ok(outcome)
}
