//! SQLite schema and its migrations
//!
//! The schema is the result of applying every migration step in order.
//! Applied steps are recorded in the `meta` table, so running the upgrade on
//! an up-to-date database does nothing and several deployments sharing a
//! database converge on the same schema.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use super::IndexError;

/// One schema change, identified by its version label
#[derive(Debug, Clone, Copy)]
pub struct MigrationStep {
    /// Labels sort lexicographically into application order
    pub version: &'static str,
    pub statements: &'static [&'static str],
}

/// All schema changes, in any order
pub const MIGRATIONS: &[MigrationStep] = &[
    MigrationStep {
        version: "2018-12-30/1 - tag support",
        statements: &[
            "CREATE TABLE tag (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                text TEXT NOT NULL
            )",
            "CREATE TABLE icon_to_tags (
                icon_id INTEGER NOT NULL REFERENCES icon(id) ON DELETE CASCADE,
                tag_id INTEGER NOT NULL REFERENCES tag(id) ON DELETE RESTRICT
            )",
        ],
    },
    MigrationStep {
        version: "2018-04-04/0 - first version",
        statements: &[
            "CREATE TABLE icon (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                modified_by TEXT NOT NULL,
                modified_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
            "CREATE TABLE icon_file (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                icon_id INTEGER NOT NULL REFERENCES icon(id) ON DELETE CASCADE,
                file_format TEXT NOT NULL,
                icon_size TEXT NOT NULL,
                content BLOB,
                UNIQUE (icon_id, file_format, icon_size)
            )",
        ],
    },
    MigrationStep {
        version: "2024-03-11/2 - tag lookup indexes",
        statements: &[
            "CREATE UNIQUE INDEX idx_tag_text ON tag(text)",
            "CREATE UNIQUE INDEX idx_icon_to_tags ON icon_to_tags(icon_id, tag_id)",
            "CREATE INDEX idx_icon_to_tags_tag_id ON icon_to_tags(tag_id)",
        ],
    },
];

/// Connection-level settings, applied on every open
pub fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
}

/// Apply every pending migration step; returns the labels applied
pub fn upgrade_schema(conn: &mut Connection) -> Result<Vec<String>, IndexError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
            version TEXT PRIMARY KEY,
            upgrade_date TEXT NOT NULL
        )",
    )
    .map_err(|source| IndexError::SchemaUpgrade {
        version: "meta".to_string(),
        source,
    })?;

    let mut steps: Vec<&MigrationStep> = MIGRATIONS.iter().collect();
    steps.sort_by_key(|step| step.version);

    let mut applied = Vec::new();
    for step in steps {
        if apply_step(conn, step).map_err(|source| IndexError::SchemaUpgrade {
            version: step.version.to_string(),
            source,
        })? {
            info!("Applied schema upgrade '{}'", step.version);
            applied.push(step.version.to_string());
        }
    }
    Ok(applied)
}

/// Apply one step in its own transaction unless already recorded
fn apply_step(conn: &mut Connection, step: &MigrationStep) -> rusqlite::Result<bool> {
    let tx = conn.transaction()?;

    let recorded = tx
        .query_row(
            "SELECT version FROM meta WHERE version = ?1",
            params![step.version],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    if recorded.is_some() {
        return Ok(false);
    }

    for statement in step.statements {
        tx.execute_batch(statement)?;
    }
    tx.execute(
        "INSERT INTO meta (version, upgrade_date) VALUES (?1, ?2)",
        params![step.version, chrono::Utc::now().to_rfc3339()],
    )?;
    tx.commit()?;
    Ok(true)
}

/// Applied versions in application order
pub fn applied_versions(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT version FROM meta ORDER BY version")?;
    let versions = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        configure_connection(&conn).unwrap();
        conn
    }

    #[test]
    fn test_upgrade_applies_all_steps_in_order() {
        let mut conn = open();
        let applied = upgrade_schema(&mut conn).unwrap();

        assert_eq!(
            applied,
            vec![
                "2018-04-04/0 - first version".to_string(),
                "2018-12-30/1 - tag support".to_string(),
                "2024-03-11/2 - tag lookup indexes".to_string(),
            ]
        );
        assert_eq!(applied_versions(&conn).unwrap(), applied);
    }

    #[test]
    fn test_upgrade_is_idempotent() {
        let mut conn = open();
        upgrade_schema(&mut conn).unwrap();

        let applied = upgrade_schema(&mut conn).unwrap();
        assert!(applied.is_empty());
        assert_eq!(applied_versions(&conn).unwrap().len(), MIGRATIONS.len());
    }

    #[test]
    fn test_tables_exist() {
        let mut conn = open();
        upgrade_schema(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        for expected in ["icon", "icon_file", "icon_to_tags", "meta", "tag"] {
            assert!(tables.contains(&expected.to_string()), "missing {}", expected);
        }
    }

    #[test]
    fn test_resumes_partially_upgraded_database() {
        let mut conn = open();
        conn.execute_batch(
            "CREATE TABLE meta (version TEXT PRIMARY KEY, upgrade_date TEXT NOT NULL)",
        )
        .unwrap();
        let first = MIGRATIONS
            .iter()
            .find(|s| s.version.starts_with("2018-04-04"))
            .unwrap();
        apply_step(&mut conn, first).unwrap();

        let applied = upgrade_schema(&mut conn).unwrap();
        assert_eq!(applied.len(), MIGRATIONS.len() - 1);
        assert!(!applied.contains(&first.version.to_string()));
    }

    #[test]
    fn test_icon_file_descriptor_is_unique_per_icon() {
        let mut conn = open();
        upgrade_schema(&mut conn).unwrap();

        conn.execute(
            "INSERT INTO icon (name, modified_by) VALUES ('dock', 'ux')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO icon_file (icon_id, file_format, icon_size) VALUES (1, 'png', '36dp')",
            [],
        )
        .unwrap();
        let duplicate = conn.execute(
            "INSERT INTO icon_file (icon_id, file_format, icon_size) VALUES (1, 'png', '36dp')",
            [],
        );
        assert!(duplicate.is_err());
    }

    #[test]
    fn test_deleting_icon_cascades() {
        let mut conn = open();
        upgrade_schema(&mut conn).unwrap();

        conn.execute_batch(
            "INSERT INTO icon (name, modified_by) VALUES ('dock', 'ux');
             INSERT INTO icon_file (icon_id, file_format, icon_size) VALUES (1, 'png', '36dp');
             INSERT INTO tag (text) VALUES ('harbor');
             INSERT INTO icon_to_tags (icon_id, tag_id) VALUES (1, 1);
             DELETE FROM icon WHERE id = 1;",
        )
        .unwrap();

        let files: i64 = conn
            .query_row("SELECT COUNT(*) FROM icon_file", [], |row| row.get(0))
            .unwrap();
        let links: i64 = conn
            .query_row("SELECT COUNT(*) FROM icon_to_tags", [], |row| row.get(0))
            .unwrap();
        assert_eq!(files, 0);
        assert_eq!(links, 0);
    }

    #[test]
    fn test_tag_in_use_cannot_be_deleted() {
        let mut conn = open();
        upgrade_schema(&mut conn).unwrap();

        conn.execute_batch(
            "INSERT INTO icon (name, modified_by) VALUES ('dock', 'ux');
             INSERT INTO tag (text) VALUES ('harbor');
             INSERT INTO icon_to_tags (icon_id, tag_id) VALUES (1, 1);",
        )
        .unwrap();

        assert!(conn.execute("DELETE FROM tag WHERE id = 1", []).is_err());
    }
}
