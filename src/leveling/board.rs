//! In-memory placement map for a cycle in its meeting phase, plus manual
//! reassignment and the best-effort bulk save.

use super::store::LevelingStore;
use super::{LevelingError, PlacementRecord};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementBreakdown {
    pub test_ratio: f64,
    pub grade_ratio: f64,
    pub anecdotal_ratio: f64,
    pub composite: f64,
    pub percentile: f64,
    pub bin_index: usize,
    pub safety_floor: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementEntry {
    pub student_id: String,
    pub display_name: String,
    pub previous_section: Option<String>,
    pub auto_section: String,
    pub final_section: String,
    pub overridden: bool,
    pub overridden_by: Option<String>,
    /// Only present when the entry was computed in this session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<PlacementBreakdown>,
}

#[derive(Debug, Clone)]
pub struct PlacementBoard {
    pub level_test_id: String,
    entries: Vec<PlacementEntry>,
    index: HashMap<String, usize>,
    /// Set until every entry has been written without error.
    unsaved: bool,
    /// Active cohort students with no saved placement when the board was
    /// loaded. They are reported, never recomputed.
    missing_student_ids: Vec<String>,
}

impl PlacementBoard {
    fn build(level_test_id: &str, entries: Vec<PlacementEntry>, unsaved: bool) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.student_id.clone(), i))
            .collect();
        Self {
            level_test_id: level_test_id.to_string(),
            entries,
            index,
            unsaved,
            missing_student_ids: Vec::new(),
        }
    }

    /// Freshly computed board; nothing of it is persisted yet.
    pub fn computed(level_test_id: &str, entries: Vec<PlacementEntry>) -> Self {
        Self::build(level_test_id, entries, true)
    }

    /// Board rebuilt from saved placement records.
    pub fn loaded(level_test_id: &str, entries: Vec<PlacementEntry>, missing_student_ids: Vec<String>) -> Self {
        let mut board = Self::build(level_test_id, entries, false);
        board.missing_student_ids = missing_student_ids;
        board
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.unsaved
    }

    pub fn missing_student_ids(&self) -> &[String] {
        &self.missing_student_ids
    }

    pub fn entries(&self) -> &[PlacementEntry] {
        &self.entries
    }

    pub fn get(&self, student_id: &str) -> Option<&PlacementEntry> {
        self.index.get(student_id).map(|i| &self.entries[*i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn overridden_count(&self) -> usize {
        self.entries.iter().filter(|e| e.overridden).count()
    }

    /// Moves a student to `section`. `auto_section` is untouched; `overridden`
    /// is re-derived against it.
    pub fn reassign(
        &mut self,
        student_id: &str,
        section: &str,
        sections: &[String],
    ) -> Result<&PlacementEntry, LevelingError> {
        if !sections.iter().any(|s| s == section) {
            return Err(LevelingError::BadParams(format!(
                "unknown section: {}",
                section
            )));
        }
        let Some(i) = self.index.get(student_id).copied() else {
            return Err(LevelingError::NotFound(format!("student {} on board", student_id)));
        };
        let entry = &mut self.entries[i];
        if entry.final_section != section {
            self.unsaved = true;
        }
        entry.final_section = section.to_string();
        entry.overridden = entry.final_section != entry.auto_section;
        Ok(&self.entries[i])
    }

    pub fn records(&self, operator_id: Option<&str>) -> Vec<PlacementRecord> {
        self.entries
            .iter()
            .map(|e| {
                let overridden = e.final_section != e.auto_section;
                PlacementRecord {
                    level_test_id: self.level_test_id.clone(),
                    student_id: e.student_id.clone(),
                    auto_section: e.auto_section.clone(),
                    final_section: e.final_section.clone(),
                    overridden,
                    overridden_by: if overridden {
                        operator_id.map(str::to_string)
                    } else {
                        None
                    },
                }
            })
            .collect()
    }

    /// Stamps `overridden_by` onto entries after a successful save.
    fn mark_saved(&mut self, record: &PlacementRecord) {
        if let Some(i) = self.index.get(&record.student_id).copied() {
            self.entries[i].overridden_by = record.overridden_by.clone();
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
    pub saved: usize,
    pub errors: usize,
    pub failed_student_ids: Vec<String>,
}

impl SaveOutcome {
    pub fn message(&self) -> String {
        if self.errors == 0 {
            format!("saved {} placement(s)", self.saved)
        } else {
            format!("saved with {} error(s)", self.errors)
        }
    }
}

/// Writes every board entry one at a time. A failed row is counted and the
/// loop moves on; nothing is rolled back.
pub fn save_board(
    store: &dyn LevelingStore,
    board: &mut PlacementBoard,
    operator_id: Option<&str>,
) -> SaveOutcome {
    let mut outcome = SaveOutcome::default();
    for record in board.records(operator_id) {
        match store.upsert_placement(&record) {
            Ok(()) => {
                outcome.saved += 1;
                board.mark_saved(&record);
            }
            Err(e) => {
                tracing::warn!(
                    level_test_id = %record.level_test_id,
                    student_id = %record.student_id,
                    error = %e,
                    "placement save failed"
                );
                outcome.errors += 1;
                outcome.failed_student_ids.push(record.student_id);
            }
        }
    }
    if outcome.errors == 0 {
        board.unsaved = false;
    }
    tracing::info!(
        level_test_id = %board.level_test_id,
        saved = outcome.saved,
        errors = outcome.errors,
        "placements saved"
    );
    outcome
}
