use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub const DB_FILE: &str = "teachingnotes.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
    init_schema(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

/// UTC timestamp with microseconds; lexical order equals time order.
pub fn now_ts() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.6fZ")
        .to_string()
}

pub fn today_prefix() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE COLLATE NOCASE,
            password_hash TEXT NOT NULL,
            role_id INTEGER NOT NULL,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL DEFAULT '',
            national_id TEXT UNIQUE,
            permit_number TEXT UNIQUE,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_role ON users(role_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            grade TEXT NOT NULL,
            birth_date TEXT,
            teacher_id TEXT,
            enrolled_at TEXT,
            health_provider TEXT,
            special_conditions TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(teacher_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_teacher ON students(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_guardians(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            guardian_id TEXT NOT NULL,
            relation_type TEXT NOT NULL CHECK(relation_type IN ('principal', 'secundario')),
            active INTEGER NOT NULL DEFAULT 1,
            assigned_at TEXT NOT NULL,
            removed_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(guardian_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_guardians_student ON student_guardians(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_guardians_guardian ON student_guardians(guardian_id)",
        [],
    )?;
    // Removed links stay as history, so uniqueness only covers active rows.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_student_guardians_active_pair
         ON student_guardians(student_id, guardian_id) WHERE active = 1",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_student_guardians_one_principal
         ON student_guardians(student_id) WHERE active = 1 AND relation_type = 'principal'",
        [],
    )?;
    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS trg_student_guardians_limit_insert
         BEFORE INSERT ON student_guardians
         WHEN NEW.active = 1 AND (
           SELECT COUNT(*) FROM student_guardians
           WHERE student_id = NEW.student_id AND active = 1
         ) >= 2
         BEGIN
           SELECT RAISE(ABORT, 'guardian_limit');
         END",
        [],
    )?;
    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS trg_student_guardians_limit_reactivate
         BEFORE UPDATE OF active ON student_guardians
         WHEN NEW.active = 1 AND OLD.active = 0 AND (
           SELECT COUNT(*) FROM student_guardians
           WHERE student_id = NEW.student_id AND active = 1
         ) >= 2
         BEGIN
           SELECT RAISE(ABORT, 'guardian_limit');
         END",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS observations(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            kind TEXT NOT NULL CHECK(kind IN ('Positiva', 'Mejora', 'Neutral')),
            teacher_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            guardian_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(teacher_id) REFERENCES users(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(guardian_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_observations_teacher ON observations(teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_observations_student ON observations(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS observation_receipts(
            id TEXT PRIMARY KEY,
            observation_id TEXT NOT NULL,
            guardian_id TEXT NOT NULL,
            read_at TEXT,
            viewed_at TEXT,
            view_count INTEGER NOT NULL DEFAULT 0,
            ip_address TEXT,
            user_agent TEXT,
            FOREIGN KEY(observation_id) REFERENCES observations(id),
            FOREIGN KEY(guardian_id) REFERENCES users(id),
            UNIQUE(observation_id, guardian_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_observation_receipts_guardian ON observation_receipts(guardian_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS media(
            id TEXT PRIMARY KEY,
            observation_id TEXT NOT NULL,
            file_name TEXT NOT NULL,
            kind TEXT NOT NULL CHECK(kind IN ('image', 'video')),
            stored_path TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            sha256 TEXT NOT NULL,
            uploaded_by TEXT,
            uploaded_at TEXT NOT NULL,
            FOREIGN KEY(observation_id) REFERENCES observations(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_media_observation ON media(observation_id)",
        [],
    )?;

    // Audit and session rows outlive the users they mention; no foreign keys.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_audit_logs(
            id TEXT PRIMARY KEY,
            admin_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            action TEXT NOT NULL,
            details TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_user_audit_logs_created ON user_audit_logs(created_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS session_logs(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            ip_address TEXT,
            user_agent TEXT,
            login_at TEXT NOT NULL,
            logout_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_session_logs_login ON session_logs(login_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS registration_requests(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL COLLATE NOCASE,
            phone TEXT NOT NULL,
            school_name TEXT,
            student_count INTEGER,
            status TEXT NOT NULL CHECK(status IN ('pendiente', 'aprobada', 'rechazada')),
            requested_at TEXT NOT NULL,
            decided_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS system_notifications(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'info',
            priority TEXT NOT NULL DEFAULT 'normal',
            is_read INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    ensure_users_columns(conn)?;
    ensure_students_columns(conn)?;
    ensure_observations_updated_at(conn)?;
    ensure_media_sha256(conn)?;
    migrate_legacy_receipt_tables(conn)?;
    migrate_legacy_student_guardian_column(conn)?;
    Ok(())
}

// Columns added after the first schema. ADD COLUMN cannot carry UNIQUE, so
// document uniqueness on old tables comes from an index instead.
fn ensure_users_columns(conn: &Connection) -> anyhow::Result<()> {
    for column in ["national_id", "permit_number"] {
        if !table_has_column(conn, "users", column)? {
            conn.execute(&format!("ALTER TABLE users ADD COLUMN {} TEXT", column), [])?;
            conn.execute(
                &format!(
                    "CREATE UNIQUE INDEX IF NOT EXISTS idx_users_{0} ON users({0})",
                    column
                ),
                [],
            )?;
        }
    }
    if !table_has_column(conn, "users", "updated_at")? {
        conn.execute("ALTER TABLE users ADD COLUMN updated_at TEXT", [])?;
    }
    Ok(())
}

fn ensure_students_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "students", "enrolled_at")? {
        conn.execute("ALTER TABLE students ADD COLUMN enrolled_at TEXT", [])?;
        // Best effort: the record's creation date stands in for enrollment.
        conn.execute(
            "UPDATE students SET enrolled_at = substr(created_at, 1, 10) WHERE enrolled_at IS NULL",
            [],
        )?;
    }
    if !table_has_column(conn, "students", "health_provider")? {
        conn.execute("ALTER TABLE students ADD COLUMN health_provider TEXT", [])?;
    }
    if !table_has_column(conn, "students", "special_conditions")? {
        conn.execute("ALTER TABLE students ADD COLUMN special_conditions TEXT", [])?;
    }
    if !table_has_column(conn, "students", "updated_at")? {
        conn.execute("ALTER TABLE students ADD COLUMN updated_at TEXT", [])?;
    }
    Ok(())
}

fn ensure_observations_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "observations", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE observations ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

/// Older media rows have no digest; they keep an empty one until re-uploaded.
fn ensure_media_sha256(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "media", "sha256")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE media ADD COLUMN sha256 TEXT NOT NULL DEFAULT ''",
        [],
    )?;
    Ok(())
}

/// Older databases tracked "read" and "viewed" in two separate tables.
/// Fold both into observation_receipts and drop them.
fn migrate_legacy_receipt_tables(conn: &Connection) -> anyhow::Result<()> {
    if table_exists(conn, "observation_readings")? {
        conn.execute(
            "INSERT INTO observation_receipts(id, observation_id, guardian_id, read_at, view_count, ip_address, user_agent)
             SELECT lower(hex(randomblob(16))), observation_id, guardian_id, read_at, 0, ip_address, user_agent
             FROM observation_readings
             WHERE true
             ON CONFLICT(observation_id, guardian_id) DO UPDATE SET
               read_at = COALESCE(observation_receipts.read_at, excluded.read_at)",
            [],
        )?;
        conn.execute("DROP TABLE observation_readings", [])?;
        log::info!("migrated legacy observation_readings into observation_receipts");
    }
    if table_exists(conn, "observation_views")? {
        conn.execute(
            "INSERT INTO observation_receipts(id, observation_id, guardian_id, viewed_at, view_count, ip_address, user_agent)
             SELECT lower(hex(randomblob(16))), observation_id, guardian_id, viewed_at, 1, ip_address, user_agent
             FROM observation_views
             WHERE true
             ON CONFLICT(observation_id, guardian_id) DO UPDATE SET
               viewed_at = excluded.viewed_at,
               view_count = observation_receipts.view_count + 1,
               ip_address = excluded.ip_address,
               user_agent = excluded.user_agent",
            [],
        )?;
        conn.execute("DROP TABLE observation_views", [])?;
        log::info!("migrated legacy observation_views into observation_receipts");
    }
    Ok(())
}

/// Older databases stored a single guardian on the student row. The link
/// table is the only source of truth now: copy those values over as
/// principal links (when the student has no active link yet) and drop the
/// column.
fn migrate_legacy_student_guardian_column(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "students", "guardian_id")? {
        return Ok(());
    }

    let moved = conn.execute(
        "INSERT INTO student_guardians(id, student_id, guardian_id, relation_type, active, assigned_at)
         SELECT lower(hex(randomblob(16))), s.id, s.guardian_id, 'principal', 1, ?
         FROM students s
         JOIN users u ON u.id = s.guardian_id
         WHERE s.guardian_id IS NOT NULL
           AND NOT EXISTS (
             SELECT 1 FROM student_guardians sg
             WHERE sg.student_id = s.id AND sg.active = 1
           )",
        [now_ts()],
    )?;
    conn.execute("UPDATE students SET guardian_id = NULL", [])?;
    if let Err(e) = conn.execute("ALTER TABLE students DROP COLUMN guardian_id", []) {
        // Column stays (e.g. it carries a constraint); it is never read again.
        log::warn!("could not drop legacy students.guardian_id: {}", e);
    }
    log::info!("moved {} legacy student guardian references into links", moved);
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> anyhow::Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        [table],
        |r| r.get(0),
    )?;
    Ok(n > 0)
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
