use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "leveling.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    // Roster rows are owned by the roster collaborator; only current_section
    // is written from here (on finalize).
    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            grade INTEGER NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            current_section TEXT,
            active INTEGER NOT NULL,
            sort_order INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT
        )",
        [],
    )?;
    ensure_students_updated_at(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_grade_sort ON students(grade, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classroom_grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            domain TEXT NOT NULL,
            percentage REAL NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classroom_grades_student ON classroom_grades(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS benchmarks(
            grade INTEGER NOT NULL,
            section TEXT NOT NULL,
            metric TEXT NOT NULL,
            target REAL NOT NULL,
            PRIMARY KEY(grade, section, metric)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS level_tests(
            id TEXT PRIMARY KEY,
            grade INTEGER NOT NULL,
            academic_year TEXT NOT NULL,
            semester INTEGER NOT NULL,
            status TEXT NOT NULL,
            created_by TEXT,
            created_at TEXT NOT NULL,
            finalized_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_level_tests_grade ON level_tests(grade)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS level_test_scores(
            id TEXT PRIMARY KEY,
            level_test_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            scores_json TEXT NOT NULL,
            previous_section TEXT,
            updated_at TEXT,
            FOREIGN KEY(level_test_id) REFERENCES level_tests(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(level_test_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_level_test_scores_test ON level_test_scores(level_test_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS level_test_anecdotal(
            id TEXT PRIMARY KEY,
            level_test_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            participation INTEGER NOT NULL,
            work_habits INTEGER NOT NULL,
            comprehension INTEGER NOT NULL,
            communication INTEGER NOT NULL,
            notes TEXT,
            watchlist INTEGER NOT NULL DEFAULT 0,
            recommendation TEXT NOT NULL DEFAULT 'keep',
            rater_id TEXT,
            updated_at TEXT,
            FOREIGN KEY(level_test_id) REFERENCES level_tests(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(level_test_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_level_test_anecdotal_test ON level_test_anecdotal(level_test_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS level_test_placements(
            id TEXT PRIMARY KEY,
            level_test_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            auto_section TEXT NOT NULL,
            final_section TEXT NOT NULL,
            overridden INTEGER NOT NULL DEFAULT 0,
            overridden_by TEXT,
            updated_at TEXT,
            FOREIGN KEY(level_test_id) REFERENCES level_tests(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(level_test_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_level_test_placements_test ON level_test_placements(level_test_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    // A corrupt row reads as unset rather than failing the caller.
    Ok(serde_json::from_str(&raw).ok())
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, &text),
    )?;
    Ok(())
}

fn ensure_students_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
