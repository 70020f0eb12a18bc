use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("enrollment.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sections(
            id TEXT PRIMARY KEY,
            strand TEXT NOT NULL,
            grade_level INTEGER NOT NULL,
            name TEXT NOT NULL,
            max_capacity INTEGER NOT NULL,
            created_at TEXT,
            UNIQUE(strand, grade_level, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sections_cohort ON sections(strand, grade_level)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            sex TEXT NOT NULL,
            strand TEXT NOT NULL,
            grade_level INTEGER NOT NULL,
            section_id TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            enrolled_at TEXT,
            created_at TEXT,
            FOREIGN KEY(section_id) REFERENCES sections(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_section ON students(section_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_cohort ON students(strand, grade_level)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_status ON students(status)",
        [],
    )?;

    // Workspaces created before approval timestamps landed lack these
    // columns. Add them on open.
    ensure_students_enrolled_at(conn)?;
    ensure_created_at_columns(conn)?;

    Ok(())
}

fn ensure_students_enrolled_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "enrolled_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN enrolled_at TEXT", [])?;
    Ok(())
}

fn ensure_created_at_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "students", "created_at")? {
        conn.execute("ALTER TABLE students ADD COLUMN created_at TEXT", [])?;
    }
    if !table_has_column(conn, "sections", "created_at")? {
        conn.execute("ALTER TABLE sections ADD COLUMN created_at TEXT", [])?;
    }
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
