use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("clusterd.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS clusters(
            cluster_id TEXT PRIMARY KEY,
            branch TEXT NOT NULL,
            batch TEXT NOT NULL,
            cluster_type TEXT NOT NULL,
            set_a INTEGER NOT NULL DEFAULT 0,
            set_b INTEGER NOT NULL DEFAULT 0,
            student_count INTEGER NOT NULL DEFAULT 0,
            created_seq INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_clusters_branch_batch ON clusters(branch, batch)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            application_number TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            branch TEXT NOT NULL,
            batch TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            cluster_id TEXT,
            set_type TEXT,
            updated_at TEXT,
            FOREIGN KEY(cluster_id) REFERENCES clusters(cluster_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_branch_batch ON students(branch, batch)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_cluster ON students(cluster_id)",
        [],
    )?;

    // Existing workspaces may have a students table without contact columns.
    ensure_students_contact_columns(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            teacher_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            branch TEXT NOT NULL,
            role TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teachers_branch ON teachers(branch)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teachers_branch_sort ON teachers(branch, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            id TEXT PRIMARY KEY,
            branch TEXT NOT NULL,
            batch TEXT NOT NULL,
            period TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            live_set TEXT NOT NULL,
            created_at TEXT,
            UNIQUE(branch, batch, start_date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_branch_batch ON sessions(branch, batch)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS session_assignments(
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            cluster_id TEXT NOT NULL,
            set_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            FOREIGN KEY(session_id) REFERENCES sessions(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(teacher_id),
            FOREIGN KEY(cluster_id) REFERENCES clusters(cluster_id),
            UNIQUE(session_id, teacher_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_session_assignments_session ON session_assignments(session_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_session_assignments_teacher ON session_assignments(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessments(
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            application_number TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            score REAL,
            remarks TEXT,
            recorded_at TEXT,
            FOREIGN KEY(session_id) REFERENCES sessions(id),
            FOREIGN KEY(application_number) REFERENCES students(application_number),
            FOREIGN KEY(teacher_id) REFERENCES teachers(teacher_id),
            UNIQUE(session_id, application_number)
        )",
        [],
    )?;
    ensure_assessments_remarks(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessments_session ON assessments(session_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessments_student ON assessments(application_number)",
        [],
    )?;

    Ok(conn)
}

fn ensure_students_contact_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "students", "email")? {
        conn.execute("ALTER TABLE students ADD COLUMN email TEXT", [])?;
    }
    if !table_has_column(conn, "students", "phone")? {
        conn.execute("ALTER TABLE students ADD COLUMN phone TEXT", [])?;
    }
    if !table_has_column(conn, "students", "updated_at")? {
        conn.execute("ALTER TABLE students ADD COLUMN updated_at TEXT", [])?;
    }
    Ok(())
}

fn ensure_assessments_remarks(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "assessments", "remarks")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE assessments ADD COLUMN remarks TEXT", [])?;
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
