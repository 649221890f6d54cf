//! Cohort leveling: turns per-student test scores, classroom grades and
//! teacher ratings into one ordered section assignment per grade.
//!
//! Pipeline: [`composite`] → [`ranking`] → [`board`], orchestrated by
//! [`workflow`] against a [`store::LevelingStore`].

pub mod board;
pub mod composite;
pub mod config;
pub mod metrics;
pub mod ranking;
pub mod store;
pub mod workflow;

use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Scores,
    Anecdotal,
    Meeting,
    Finalized,
}

impl Phase {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "setup" => Some(Self::Setup),
            "scores" => Some(Self::Scores),
            "anecdotal" => Some(Self::Anecdotal),
            "meeting" => Some(Self::Meeting),
            "finalized" => Some(Self::Finalized),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Scores => "scores",
            Self::Anecdotal => "anecdotal",
            Self::Meeting => "meeting",
            Self::Finalized => "finalized",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Keep,
    MoveUp,
    MoveDown,
}

impl Recommendation {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "keep" => Some(Self::Keep),
            "move_up" => Some(Self::MoveUp),
            "move_down" => Some(Self::MoveDown),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Keep => "keep",
            Self::MoveUp => "move_up",
            Self::MoveDown => "move_down",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub grade: i64,
    pub display_name: String,
    pub current_section: Option<String>,
    pub active: bool,
    pub sort_order: i64,
}

/// One leveling cycle for a grade.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelTest {
    pub id: String,
    pub grade: i64,
    pub academic_year: String,
    pub semester: i64,
    pub status: Phase,
    pub created_by: Option<String>,
    pub created_at: String,
    pub finalized_at: Option<String>,
}

/// Sparse raw metrics for one student; the key set depends on the grade's
/// test template.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreRecord {
    pub level_test_id: String,
    pub student_id: String,
    pub scores: BTreeMap<String, f64>,
    pub previous_section: Option<String>,
}

impl ScoreRecord {
    pub fn metric(&self, key: &str) -> Option<f64> {
        self.scores.get(key).copied().filter(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnecdotalRating {
    pub level_test_id: String,
    pub student_id: String,
    pub participation: i64,
    pub work_habits: i64,
    pub comprehension: i64,
    pub communication: i64,
    pub notes: Option<String>,
    pub watchlist: bool,
    pub recommendation: Recommendation,
    pub rater_id: Option<String>,
}

impl AnecdotalRating {
    pub const MIN_RATING: i64 = 1;
    pub const MAX_RATING: i64 = 4;

    pub fn ratings(&self) -> [i64; 4] {
        [
            self.participation,
            self.work_habits,
            self.comprehension,
            self.communication,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassroomGrade {
    pub domain: String,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementRecord {
    pub level_test_id: String,
    pub student_id: String,
    pub auto_section: String,
    pub final_section: String,
    pub overridden: bool,
    pub overridden_by: Option<String>,
}

#[derive(Debug, Error)]
pub enum LevelingError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    BadParams(String),
    #[error("{0}")]
    Conflict(String),
    #[error("level test is already finalized")]
    AlreadyFinalized,
    #[error("finalize requires confirm: true")]
    ConfirmationRequired,
    #[error("no placements to finalize; open the meeting phase first")]
    NoPlacements,
    #[error("meeting phase is not open for this level test")]
    MeetingNotOpen,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl LevelingError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadParams(_) => "bad_params",
            Self::Conflict(_) => "conflict",
            Self::AlreadyFinalized => "already_finalized",
            Self::ConfirmationRequired => "confirmation_required",
            Self::NoPlacements => "no_placements",
            Self::MeetingNotOpen => "meeting_not_open",
            Self::Store(_) => "db_query_failed",
        }
    }
}

pub fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
