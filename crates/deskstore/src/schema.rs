//! Database schema migrations and demo data.
//!
//! Migrations are versioned through the `schema_version` table and applied
//! when the store is opened.

use rusqlite::{Connection, OptionalExtension, Result as SqliteResult};

/// Name of the generator row that hands out `client_status_log` ids
pub const STATUS_LOG_SEQUENCE: &str = "client_status_log";

pub fn migrate(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );",
    )?;

    let current = schema_version(conn)?;
    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    Ok(())
}

fn schema_version(conn: &Connection) -> SqliteResult<i32> {
    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i32>>(0)
        })
        .optional()?;
    Ok(version.flatten().unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> SqliteResult<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// v1: clients, invoices and the audit log
fn migrate_v1(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS clients (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            name    TEXT NOT NULL,
            active  INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS invoices (
            id        INTEGER PRIMARY KEY AUTOINCREMENT,
            client_id INTEGER NOT NULL REFERENCES clients(id),
            amount    REAL NOT NULL,
            status    TEXT NOT NULL DEFAULT 'pending'
                      CHECK (status IN ('pending', 'overdue', 'paid', 'closed_by_override'))
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            actor_id   INTEGER NOT NULL,
            action     TEXT NOT NULL,
            details    TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_invoices_client_status ON invoices(client_id, status);",
    )?;
    set_schema_version(&tx, 1)?;
    tx.commit()
}

/// v2: status history keyed by an explicit id generator.
///
/// The trigger takes the next id from `id_sequences`, so a generator that
/// falls behind the table collides on the primary key.
fn migrate_v2(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS id_sequences (
            name  TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS client_status_log (
            id         INTEGER PRIMARY KEY,
            client_id  INTEGER NOT NULL,
            active     INTEGER NOT NULL,
            changed_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        INSERT OR IGNORE INTO id_sequences (name, value) VALUES ('client_status_log', 0);

        CREATE TRIGGER IF NOT EXISTS log_client_status
        AFTER UPDATE OF active ON clients
        WHEN OLD.active <> NEW.active
        BEGIN
            INSERT INTO client_status_log (id, client_id, active)
            VALUES (
                (SELECT value + 1 FROM id_sequences WHERE name = 'client_status_log'),
                NEW.id,
                NEW.active
            );
            UPDATE id_sequences SET value = value + 1 WHERE name = 'client_status_log';
        END;",
    )?;
    set_schema_version(&tx, 2)?;
    tx.commit()
}

/// Client 42 has two blocking invoices, 7 only a paid one, 13 none
pub fn seed_demo(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        "INSERT OR IGNORE INTO clients (id, name, active) VALUES
            (42, 'Northwind Traders', 1),
            (7, 'Acme Corp', 1),
            (13, 'Globex', 1);

        INSERT OR IGNORE INTO invoices (id, client_id, amount, status) VALUES
            (1, 42, 1200.0, 'pending'),
            (2, 42, 320.5, 'overdue'),
            (3, 7, 99.0, 'paid');",
    )?;
    tx.commit()?;
    tracing::debug!("Demo data seeded");
    Ok(())
}
