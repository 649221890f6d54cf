use super::config::CompositeWeights;
use super::metrics::{BenchmarkRow, METRICS};
use super::{AnecdotalRating, ClassroomGrade, ScoreRecord};
use serde::Serialize;

/// Ratio used for a signal that is entirely absent.
pub const NEUTRAL_RATIO: f64 = 0.5;

/// Everything the scorer may know about one student. Any part may be missing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScorerInputs<'a> {
    pub scores: Option<&'a ScoreRecord>,
    /// Benchmark row of the student's current section.
    pub benchmark: Option<&'a BenchmarkRow>,
    pub grades: &'a [ClassroomGrade],
    pub rating: Option<&'a AnecdotalRating>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeBreakdown {
    pub test_ratio: f64,
    pub grade_ratio: f64,
    pub anecdotal_ratio: f64,
    pub composite: f64,
    pub metrics_used: usize,
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

pub fn test_ratio(scores: Option<&ScoreRecord>, benchmark: Option<&BenchmarkRow>) -> (f64, usize) {
    let Some(scores) = scores else {
        return (NEUTRAL_RATIO, 0);
    };
    let ratios: Vec<f64> = METRICS
        .iter()
        .filter_map(|m| m.ratio(&scores.scores, benchmark))
        .collect();
    (mean(&ratios).unwrap_or(NEUTRAL_RATIO), ratios.len())
}

pub fn grade_ratio(grades: &[ClassroomGrade]) -> f64 {
    let pct: Vec<f64> = grades
        .iter()
        .map(|g| g.percentage)
        .filter(|p| p.is_finite())
        .map(|p| p.clamp(0.0, 100.0))
        .collect();
    mean(&pct).map(|m| m / 100.0).unwrap_or(NEUTRAL_RATIO)
}

pub fn anecdotal_ratio(rating: Option<&AnecdotalRating>) -> f64 {
    let Some(rating) = rating else {
        return NEUTRAL_RATIO;
    };
    let values: Vec<f64> = rating
        .ratings()
        .iter()
        .map(|r| (*r).clamp(0, AnecdotalRating::MAX_RATING) as f64)
        .collect();
    mean(&values)
        .map(|m| m / AnecdotalRating::MAX_RATING as f64)
        .unwrap_or(NEUTRAL_RATIO)
}

pub fn composite_score(inputs: &ScorerInputs<'_>, weights: &CompositeWeights) -> CompositeBreakdown {
    let (test, metrics_used) = test_ratio(inputs.scores, inputs.benchmark);
    let grade = grade_ratio(inputs.grades);
    let anecdotal = anecdotal_ratio(inputs.rating);
    CompositeBreakdown {
        test_ratio: test,
        grade_ratio: grade,
        anecdotal_ratio: anecdotal,
        composite: weights.test * test + weights.grades * grade + weights.anecdotal * anecdotal,
        metrics_used,
    }
}
