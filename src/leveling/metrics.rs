use std::collections::{BTreeMap, HashMap};

pub const CWPM: &str = "cwpm";
pub const WRITING: &str = "writing";
pub const MC_CORRECT: &str = "mc_correct";
pub const MC_TOTAL: &str = "mc_total";
pub const WORD_READING_CORRECT: &str = "word_reading_correct";
pub const WORD_READING_ATTEMPTED: &str = "word_reading_attempted";
pub const LETTER_SOUNDS: &str = "letter_sounds";
pub const ORAL_RETELL: &str = "oral_retell";

/// Target values for one (grade, section), keyed by metric.
pub type BenchmarkRow = BTreeMap<String, f64>;

/// Where a metric's normalizing denominator comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denominator {
    /// Benchmark target for the student's current section.
    Benchmark(&'static str),
    /// Another value in the same score record (e.g. items attempted).
    Field(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct MetricSpec {
    pub key: &'static str,
    /// Tried in order; the first positive value wins.
    pub denominators: &'static [Denominator],
}

/// Every metric the scorer knows how to normalize. Grade templates only
/// ever carry a subset of these keys.
pub const METRICS: &[MetricSpec] = &[
    MetricSpec {
        key: CWPM,
        denominators: &[Denominator::Benchmark(CWPM)],
    },
    MetricSpec {
        key: WRITING,
        denominators: &[Denominator::Benchmark(WRITING)],
    },
    MetricSpec {
        key: MC_CORRECT,
        denominators: &[
            Denominator::Field(MC_TOTAL),
            Denominator::Benchmark(MC_CORRECT),
        ],
    },
    MetricSpec {
        key: WORD_READING_CORRECT,
        denominators: &[
            Denominator::Field(WORD_READING_ATTEMPTED),
            Denominator::Benchmark(WORD_READING_CORRECT),
        ],
    },
    MetricSpec {
        key: LETTER_SOUNDS,
        denominators: &[Denominator::Benchmark(LETTER_SOUNDS)],
    },
    MetricSpec {
        key: ORAL_RETELL,
        denominators: &[Denominator::Benchmark(ORAL_RETELL)],
    },
];

fn positive(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite() && *x > 0.0)
}

impl MetricSpec {
    pub fn denominator(
        &self,
        scores: &BTreeMap<String, f64>,
        benchmark: Option<&BenchmarkRow>,
    ) -> Option<f64> {
        self.denominators.iter().find_map(|d| match d {
            Denominator::Benchmark(k) => positive(benchmark.and_then(|row| row.get(*k).copied())),
            Denominator::Field(k) => positive(scores.get(*k).copied()),
        })
    }

    /// `value / denominator` clamped to [0, 1], or `None` when either side is
    /// unusable.
    pub fn ratio(&self, scores: &BTreeMap<String, f64>, benchmark: Option<&BenchmarkRow>) -> Option<f64> {
        let value = scores.get(self.key).copied().filter(|v| v.is_finite())?;
        let denom = self.denominator(scores, benchmark)?;
        Some((value / denom).clamp(0.0, 1.0))
    }
}

pub fn is_known_metric(key: &str) -> bool {
    METRICS.iter().any(|m| m.key == key) || key == MC_TOTAL || key == WORD_READING_ATTEMPTED
}

/// Benchmark rows for one grade, keyed by section name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BenchmarkRegistry {
    pub grade: i64,
    rows: HashMap<String, BenchmarkRow>,
}

impl BenchmarkRegistry {
    pub fn new(grade: i64) -> Self {
        Self {
            grade,
            rows: HashMap::new(),
        }
    }

    pub fn insert(&mut self, section: &str, metric: &str, target: f64) {
        self.rows
            .entry(section.to_string())
            .or_default()
            .insert(metric.to_string(), target);
    }

    pub fn row(&self, section: &str) -> Option<&BenchmarkRow> {
        self.rows.get(section)
    }

    pub fn sections(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.rows.keys().map(String::as_str).collect();
        out.sort_unstable();
        out
    }
}
