use crate::core::error::CovenantError;
use rusqlite::Connection;
use std::path::Path;

/// Open a connection with the hardening pragmas every covenant database uses.
pub fn db_connect(db_path: &Path) -> Result<Connection, CovenantError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(CovenantError::Sqlite)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(CovenantError::Sqlite)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(CovenantError::Sqlite)?;
    Ok(conn)
}

// Subsystems own their schemas and initialization; this module only knows how
// to open a hardened connection.
