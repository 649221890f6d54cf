//! Persistence contract for leveling records and its SQLite implementation.
//!
//! Upserts are keyed by `(level_test_id, student_id)` and replace the whole
//! row. There is no field merge and no version check: the last write wins.

use super::metrics::BenchmarkRegistry;
use super::{
    now_stamp, AnecdotalRating, ClassroomGrade, LevelTest, Phase, PlacementRecord,
    Recommendation, ScoreRecord, Student,
};
use anyhow::anyhow;
use rusqlite::{Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

pub trait LevelingStore {
    fn level_test(&self, test_id: &str) -> anyhow::Result<Option<LevelTest>>;
    fn list_level_tests(&self, grade: Option<i64>) -> anyhow::Result<Vec<LevelTest>>;
    fn insert_level_test(&self, test: &LevelTest) -> anyhow::Result<()>;
    fn has_open_level_test(&self, grade: i64, academic_year: &str, semester: i64) -> anyhow::Result<bool>;
    fn set_level_test_status(
        &self,
        test_id: &str,
        status: Phase,
        finalized_at: Option<&str>,
    ) -> anyhow::Result<()>;

    fn student(&self, student_id: &str) -> anyhow::Result<Option<Student>>;
    /// Active students of a grade in roster order.
    fn cohort(&self, grade: i64) -> anyhow::Result<Vec<Student>>;
    fn set_current_section(&self, student_id: &str, section: &str) -> anyhow::Result<()>;

    fn benchmarks(&self, grade: i64) -> anyhow::Result<BenchmarkRegistry>;
    fn replace_benchmarks(
        &self,
        grade: i64,
        section: &str,
        targets: &BTreeMap<String, f64>,
    ) -> anyhow::Result<()>;
    fn classroom_grades(&self, grade: i64) -> anyhow::Result<HashMap<String, Vec<ClassroomGrade>>>;

    fn score_records(&self, test_id: &str) -> anyhow::Result<Vec<ScoreRecord>>;
    fn upsert_score_record(&self, record: &ScoreRecord) -> anyhow::Result<()>;
    fn anecdotal_ratings(&self, test_id: &str) -> anyhow::Result<Vec<AnecdotalRating>>;
    fn upsert_anecdotal(&self, rating: &AnecdotalRating) -> anyhow::Result<()>;
    fn placements(&self, test_id: &str) -> anyhow::Result<Vec<PlacementRecord>>;
    fn upsert_placement(&self, record: &PlacementRecord) -> anyhow::Result<()>;
    /// Non-finalized level tests that already have saved placements.
    fn open_tests_with_placements(&self) -> anyhow::Result<Vec<String>>;
}

pub struct SqliteStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

fn level_test_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<LevelTest> {
    let status: String = r.get(4)?;
    let status = Phase::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown level test status: {}", status).into(),
        )
    })?;
    Ok(LevelTest {
        id: r.get(0)?,
        grade: r.get(1)?,
        academic_year: r.get(2)?,
        semester: r.get(3)?,
        status,
        created_by: r.get(5)?,
        created_at: r.get(6)?,
        finalized_at: r.get(7)?,
    })
}

fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Student> {
    let last: String = r.get(2)?;
    let first: String = r.get(3)?;
    Ok(Student {
        id: r.get(0)?,
        grade: r.get(1)?,
        display_name: format!("{}, {}", last, first),
        current_section: r.get(4)?,
        active: r.get::<_, i64>(5)? != 0,
        sort_order: r.get(6)?,
    })
}

const LEVEL_TEST_COLUMNS: &str =
    "id, grade, academic_year, semester, status, created_by, created_at, finalized_at";
const STUDENT_COLUMNS: &str =
    "id, grade, last_name, first_name, current_section, active, sort_order";

impl LevelingStore for SqliteStore<'_> {
    fn level_test(&self, test_id: &str) -> anyhow::Result<Option<LevelTest>> {
        let sql = format!("SELECT {} FROM level_tests WHERE id = ?", LEVEL_TEST_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, [test_id], level_test_from_row)
            .optional()?)
    }

    fn list_level_tests(&self, grade: Option<i64>) -> anyhow::Result<Vec<LevelTest>> {
        let sql = format!(
            "SELECT {} FROM level_tests
             WHERE (?1 IS NULL OR grade = ?1)
             ORDER BY grade, created_at, id",
            LEVEL_TEST_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([grade], level_test_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn insert_level_test(&self, test: &LevelTest) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO level_tests(id, grade, academic_year, semester, status, created_by, created_at, finalized_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &test.id,
                test.grade,
                &test.academic_year,
                test.semester,
                test.status.as_str(),
                &test.created_by,
                &test.created_at,
                &test.finalized_at,
            ),
        )?;
        Ok(())
    }

    fn has_open_level_test(&self, grade: i64, academic_year: &str, semester: i64) -> anyhow::Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM level_tests
                 WHERE grade = ? AND academic_year = ? AND semester = ? AND status <> 'finalized'
                 LIMIT 1",
                (grade, academic_year, semester),
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn set_level_test_status(
        &self,
        test_id: &str,
        status: Phase,
        finalized_at: Option<&str>,
    ) -> anyhow::Result<()> {
        let changed = self.conn.execute(
            "UPDATE level_tests SET status = ?, finalized_at = COALESCE(?, finalized_at) WHERE id = ?",
            (status.as_str(), finalized_at, test_id),
        )?;
        if changed == 0 {
            return Err(anyhow!("level test {} not found", test_id));
        }
        Ok(())
    }

    fn student(&self, student_id: &str) -> anyhow::Result<Option<Student>> {
        let sql = format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, [student_id], student_from_row)
            .optional()?)
    }

    fn cohort(&self, grade: i64) -> anyhow::Result<Vec<Student>> {
        let sql = format!(
            "SELECT {} FROM students WHERE grade = ? AND active = 1 ORDER BY sort_order, id",
            STUDENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([grade], student_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn set_current_section(&self, student_id: &str, section: &str) -> anyhow::Result<()> {
        let changed = self.conn.execute(
            "UPDATE students SET current_section = ?, updated_at = ? WHERE id = ?",
            (section, now_stamp(), student_id),
        )?;
        if changed == 0 {
            return Err(anyhow!("student {} not found", student_id));
        }
        Ok(())
    }

    fn benchmarks(&self, grade: i64) -> anyhow::Result<BenchmarkRegistry> {
        let mut stmt = self.conn.prepare(
            "SELECT section, metric, target FROM benchmarks WHERE grade = ? ORDER BY section, metric",
        )?;
        let rows = stmt
            .query_map([grade], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, f64>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut reg = BenchmarkRegistry::new(grade);
        for (section, metric, target) in rows {
            reg.insert(&section, &metric, target);
        }
        Ok(reg)
    }

    fn replace_benchmarks(
        &self,
        grade: i64,
        section: &str,
        targets: &BTreeMap<String, f64>,
    ) -> anyhow::Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM benchmarks WHERE grade = ? AND section = ?",
            (grade, section),
        )?;
        for (metric, target) in targets {
            tx.execute(
                "INSERT INTO benchmarks(grade, section, metric, target) VALUES(?, ?, ?, ?)",
                (grade, section, metric, target),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn classroom_grades(&self, grade: i64) -> anyhow::Result<HashMap<String, Vec<ClassroomGrade>>> {
        let mut stmt = self.conn.prepare(
            "SELECT g.student_id, g.domain, g.percentage
             FROM classroom_grades g
             JOIN students s ON s.id = g.student_id
             WHERE s.grade = ?
             ORDER BY g.student_id, g.domain",
        )?;
        let rows = stmt
            .query_map([grade], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    ClassroomGrade {
                        domain: r.get(1)?,
                        percentage: r.get(2)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut out: HashMap<String, Vec<ClassroomGrade>> = HashMap::new();
        for (student_id, g) in rows {
            out.entry(student_id).or_default().push(g);
        }
        Ok(out)
    }

    fn score_records(&self, test_id: &str) -> anyhow::Result<Vec<ScoreRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT student_id, scores_json, previous_section
             FROM level_test_scores
             WHERE level_test_id = ?
             ORDER BY student_id",
        )?;
        let rows = stmt
            .query_map([test_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = Vec::with_capacity(rows.len());
        for (student_id, scores_json, previous_section) in rows {
            let scores: BTreeMap<String, f64> = serde_json::from_str(&scores_json)
                .map_err(|e| anyhow!("scores for student {} are corrupt: {}", student_id, e))?;
            out.push(ScoreRecord {
                level_test_id: test_id.to_string(),
                student_id,
                scores,
                previous_section,
            });
        }
        Ok(out)
    }

    fn upsert_score_record(&self, record: &ScoreRecord) -> anyhow::Result<()> {
        let scores_json = serde_json::to_string(&record.scores)?;
        self.conn.execute(
            "INSERT INTO level_test_scores(id, level_test_id, student_id, scores_json, previous_section, updated_at)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(level_test_id, student_id) DO UPDATE SET
               scores_json = excluded.scores_json,
               previous_section = excluded.previous_section,
               updated_at = excluded.updated_at",
            (
                Uuid::new_v4().to_string(),
                &record.level_test_id,
                &record.student_id,
                &scores_json,
                &record.previous_section,
                now_stamp(),
            ),
        )?;
        Ok(())
    }

    fn anecdotal_ratings(&self, test_id: &str) -> anyhow::Result<Vec<AnecdotalRating>> {
        let mut stmt = self.conn.prepare(
            "SELECT student_id, participation, work_habits, comprehension, communication,
                    notes, watchlist, recommendation, rater_id
             FROM level_test_anecdotal
             WHERE level_test_id = ?
             ORDER BY student_id",
        )?;
        let rows = stmt
            .query_map([test_id], |r| {
                let recommendation: String = r.get(7)?;
                Ok(AnecdotalRating {
                    level_test_id: test_id.to_string(),
                    student_id: r.get(0)?,
                    participation: r.get(1)?,
                    work_habits: r.get(2)?,
                    comprehension: r.get(3)?,
                    communication: r.get(4)?,
                    notes: r.get(5)?,
                    watchlist: r.get::<_, i64>(6)? != 0,
                    recommendation: Recommendation::parse(&recommendation)
                        .unwrap_or(Recommendation::Keep),
                    rater_id: r.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn upsert_anecdotal(&self, rating: &AnecdotalRating) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO level_test_anecdotal(
                id, level_test_id, student_id, participation, work_habits, comprehension,
                communication, notes, watchlist, recommendation, rater_id, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(level_test_id, student_id) DO UPDATE SET
               participation = excluded.participation,
               work_habits = excluded.work_habits,
               comprehension = excluded.comprehension,
               communication = excluded.communication,
               notes = excluded.notes,
               watchlist = excluded.watchlist,
               recommendation = excluded.recommendation,
               rater_id = excluded.rater_id,
               updated_at = excluded.updated_at",
            (
                Uuid::new_v4().to_string(),
                &rating.level_test_id,
                &rating.student_id,
                rating.participation,
                rating.work_habits,
                rating.comprehension,
                rating.communication,
                &rating.notes,
                rating.watchlist as i64,
                rating.recommendation.as_str(),
                &rating.rater_id,
                now_stamp(),
            ),
        )?;
        Ok(())
    }

    fn placements(&self, test_id: &str) -> anyhow::Result<Vec<PlacementRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.student_id, p.auto_section, p.final_section, p.overridden, p.overridden_by
             FROM level_test_placements p
             LEFT JOIN students s ON s.id = p.student_id
             WHERE p.level_test_id = ?
             ORDER BY COALESCE(s.sort_order, 0), p.student_id",
        )?;
        let rows = stmt
            .query_map([test_id], |r| {
                Ok(PlacementRecord {
                    level_test_id: test_id.to_string(),
                    student_id: r.get(0)?,
                    auto_section: r.get(1)?,
                    final_section: r.get(2)?,
                    overridden: r.get::<_, i64>(3)? != 0,
                    overridden_by: r.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn upsert_placement(&self, record: &PlacementRecord) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO level_test_placements(
                id, level_test_id, student_id, auto_section, final_section, overridden,
                overridden_by, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(level_test_id, student_id) DO UPDATE SET
               auto_section = excluded.auto_section,
               final_section = excluded.final_section,
               overridden = excluded.overridden,
               overridden_by = excluded.overridden_by,
               updated_at = excluded.updated_at",
            (
                Uuid::new_v4().to_string(),
                &record.level_test_id,
                &record.student_id,
                &record.auto_section,
                &record.final_section,
                record.overridden as i64,
                &record.overridden_by,
                now_stamp(),
            ),
        )?;
        Ok(())
    }

    fn open_tests_with_placements(&self) -> anyhow::Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT t.id
             FROM level_tests t
             WHERE t.status <> 'finalized'
               AND EXISTS (SELECT 1 FROM level_test_placements p WHERE p.level_test_id = t.id)
             ORDER BY t.created_at, t.id",
        )?;
        let rows = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
