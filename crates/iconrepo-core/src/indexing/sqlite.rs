//! Relational index on SQLite
//!
//! Writes go through one connection behind an async mutex. Every mutation
//! runs in a single `BEGIN IMMEDIATE` transaction that stays open while the
//! side effect runs; the transaction is committed only when the side effect
//! succeeds. File databases run in WAL mode and answer reads from a second,
//! read-only connection, so queries see the last committed state instead of
//! queueing behind a pending side effect.

use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::error::is_unique_violation;
use super::schema::{configure_connection, upgrade_schema};
use super::{run_side_effect, IndexError, IndexRepository, ResultExt, SideEffect};
use crate::models::{IconDescriptor, IconfileDescriptor, TagUsage};

/// How long to keep trying while the database is unreachable at startup
#[derive(Debug, Clone, Copy)]
pub struct SetupRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for SetupRetry {
    fn default() -> Self {
        Self {
            attempts: 30,
            delay: Duration::from_secs(2),
        }
    }
}

/// SQLite-backed index repository
pub struct SqliteIndex {
    writer: Mutex<Connection>,
    /// Absent for in-memory databases, which cannot be shared
    reader: Option<Mutex<Connection>>,
    location: String,
}

impl SqliteIndex {
    /// Open (or create) the database at `path` and bring its schema up to date
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        Self::open_with_retry(path, SetupRetry::default()).await
    }

    pub async fn open_with_retry(
        path: impl AsRef<Path>,
        retry: SetupRetry,
    ) -> Result<Self, IndexError> {
        let path = path.as_ref();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match Self::open_file(path) {
                Ok(index) => return Ok(index),
                Err(e) if e.is_transient() && attempt < retry.attempts => {
                    warn!(
                        "Database {:?} not ready (attempt {}/{}): {}",
                        path, attempt, retry.attempts, e
                    );
                    tokio::time::sleep(retry.delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(IndexError::Unavailable {
                        attempts: attempt,
                        source: Box::new(e),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Private in-memory database, mainly for tests
    pub fn open_in_memory() -> Result<Self, IndexError> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn, ":memory:".to_string())
    }

    fn open_file(path: &Path) -> Result<Self, IndexError> {
        let conn =
            Connection::open(path).context(format!("Failed to open database {:?}", path))?;
        let mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .context("Failed to enable write-ahead logging")?;
        if !mode.eq_ignore_ascii_case("wal") {
            warn!(
                "Database {:?} stays in {} journal mode; reads may wait for writers",
                path, mode
            );
        }
        let mut index = Self::from_connection(conn, path.display().to_string())?;

        let reader = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context(format!("Failed to open read connection to {:?}", path))?;
        configure_connection(&reader).context("Failed to configure read connection")?;
        index.reader = Some(Mutex::new(reader));
        Ok(index)
    }

    fn from_connection(mut conn: Connection, location: String) -> Result<Self, IndexError> {
        configure_connection(&conn).context("Failed to configure connection")?;
        let applied = upgrade_schema(&mut conn)?;
        info!(
            "Opened SQLite index at {} ({} schema upgrades applied)",
            location,
            applied.len()
        );
        Ok(Self {
            writer: Mutex::new(conn),
            reader: None,
            location,
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Run `query` against committed data
    async fn read<T, F>(&self, operation: &str, query: F) -> Result<T, IndexError>
    where
        F: FnOnce(&Connection) -> Result<T, IndexError> + Send,
        T: Send,
    {
        match &self.reader {
            Some(reader) => {
                let conn = reader.lock().await;
                snapshot(&conn, operation, query)
            }
            None => {
                let conn = self.writer.lock().await;
                query(&conn)
            }
        }
    }

    /// Run `change` and then the side effect inside one transaction
    async fn write<T, F>(
        &self,
        operation: &str,
        change: F,
        side_effect: Option<SideEffect<'_>>,
    ) -> Result<T, IndexError>
    where
        F: FnOnce(&Connection) -> Result<T, IndexError> + Send,
        T: Send,
    {
        let conn = self.writer.lock().await;

        // A cancelled caller can leave its transaction open
        if !conn.is_autocommit() {
            warn!("Discarding transaction left open by an interrupted operation");
            conn.execute_batch("ROLLBACK")
                .context("Failed to discard stale transaction")?;
        }

        conn.execute_batch("BEGIN IMMEDIATE")
            .context(format!("Failed to begin {}", operation))?;

        let value = match change(&*conn) {
            Ok(value) => value,
            Err(e) => {
                rollback(&conn, operation);
                return Err(e);
            }
        };

        if let Err(source) = run_side_effect(side_effect).await {
            let compensated = rollback(&conn, operation);
            if !compensated {
                error!(
                    "Index and blobstore may now disagree after failed {}",
                    operation
                );
            }
            return Err(IndexError::SideEffect {
                operation: operation.to_string(),
                compensated,
                source,
            });
        }

        if let Err(e) = conn.execute_batch("COMMIT") {
            rollback(&conn, operation);
            return Err(IndexError::Database {
                context: format!("Failed to commit {}", operation),
                source: e,
            });
        }
        Ok(value)
    }
}

/// Multi-statement reads see a single snapshot
fn snapshot<T, F>(conn: &Connection, operation: &str, query: F) -> Result<T, IndexError>
where
    F: FnOnce(&Connection) -> Result<T, IndexError>,
{
    let tx = conn
        .unchecked_transaction()
        .context(format!("Failed to begin {}", operation))?;
    query(&tx)
}

/// Roll back the open transaction; returns whether that worked
fn rollback(conn: &Connection, operation: &str) -> bool {
    match conn.execute_batch("ROLLBACK") {
        Ok(()) => true,
        Err(e) => {
            error!("Failed to roll back {}: {}", operation, e);
            false
        }
    }
}

// ==================== Row helpers ====================

fn find_icon_id(conn: &Connection, icon_name: &str) -> Result<Option<i64>, IndexError> {
    let context = || format!("Failed to look up icon {}", icon_name);
    let mut stmt = conn
        .prepare_cached("SELECT id FROM icon WHERE name = ?1")
        .context(context())?;
    let ids = stmt
        .query_map(params![icon_name], |row| row.get::<_, i64>(0))
        .context(context())?
        .collect::<rusqlite::Result<Vec<i64>>>()
        .context(context())?;

    match ids.as_slice() {
        [] => Ok(None),
        [id] => Ok(Some(*id)),
        _ => Err(IndexError::TooManyFound(format!("icon {}", icon_name))),
    }
}

fn require_icon_id(conn: &Connection, icon_name: &str) -> Result<i64, IndexError> {
    find_icon_id(conn, icon_name)?.ok_or_else(|| IndexError::IconNotFound(icon_name.to_string()))
}

fn describe(conn: &Connection, icon_name: &str) -> Result<IconDescriptor, IndexError> {
    let context = || format!("Failed to describe icon {}", icon_name);

    let (icon_id, modified_by): (i64, String) = conn
        .query_row(
            "SELECT id, modified_by FROM icon WHERE name = ?1",
            params![icon_name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context(context())?
        .ok_or_else(|| IndexError::IconNotFound(icon_name.to_string()))?;

    let mut icon = IconDescriptor::new(icon_name, modified_by);

    let mut stmt = conn
        .prepare_cached(
            "SELECT file_format, icon_size FROM icon_file
             WHERE icon_id = ?1 ORDER BY file_format, icon_size",
        )
        .context(context())?;
    icon.iconfiles = stmt
        .query_map(params![icon_id], |row| {
            Ok(IconfileDescriptor::new(
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
            ))
        })
        .context(context())?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context(context())?;

    let mut stmt = conn
        .prepare_cached(
            "SELECT t.text FROM tag t
             INNER JOIN icon_to_tags it ON it.tag_id = t.id
             WHERE it.icon_id = ?1",
        )
        .context(context())?;
    icon.tags = stmt
        .query_map(params![icon_id], |row| row.get::<_, String>(0))
        .context(context())?
        .collect::<rusqlite::Result<_>>()
        .context(context())?;

    Ok(icon)
}

fn insert_iconfile(
    conn: &Connection,
    icon_id: i64,
    icon_name: &str,
    iconfile: &IconfileDescriptor,
) -> Result<(), IndexError> {
    // The content column is legacy; content lives in the blobstore
    let result = conn.execute(
        "INSERT INTO icon_file (icon_id, file_format, icon_size, content) VALUES (?1, ?2, ?3, NULL)",
        params![icon_id, iconfile.format, iconfile.size],
    );
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(IndexError::IconfileAlreadyExists {
            icon: icon_name.to_string(),
            iconfile: iconfile.clone(),
        }),
        Err(e) => Err(IndexError::Database {
            context: format!("Failed to add iconfile {} to {}", iconfile, icon_name),
            source: e,
        }),
    }
}

fn touch_icon(conn: &Connection, icon_id: i64, modified_by: &str) -> Result<(), IndexError> {
    conn.execute(
        "UPDATE icon SET modified_by = ?1, modified_at = CURRENT_TIMESTAMP WHERE id = ?2",
        params![modified_by, icon_id],
    )
    .context("Failed to update icon modifier")?;
    Ok(())
}

fn find_tag_id(conn: &Connection, tag: &str) -> Result<Option<i64>, IndexError> {
    conn.query_row("SELECT id FROM tag WHERE text = ?1", params![tag], |row| {
        row.get(0)
    })
    .optional()
    .context(format!("Failed to look up tag {}", tag))
}

fn get_or_create_tag(conn: &Connection, tag: &str) -> Result<i64, IndexError> {
    if let Some(id) = find_tag_id(conn, tag)? {
        return Ok(id);
    }
    conn.execute("INSERT INTO tag (text) VALUES (?1)", params![tag])
        .context(format!("Failed to create tag {}", tag))?;
    Ok(conn.last_insert_rowid())
}

/// Delete the tag row once no icon references it
fn delete_tag_if_unused(conn: &Connection, tag_id: i64) -> Result<(), IndexError> {
    let references: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM icon_to_tags WHERE tag_id = ?1",
            params![tag_id],
            |row| row.get(0),
        )
        .context("Failed to count tag references")?;

    if references == 0 {
        conn.execute("DELETE FROM tag WHERE id = ?1", params![tag_id])
            .context("Failed to delete unused tag")?;
    }
    Ok(())
}

/// Delete an icon with its iconfiles and drop tags nobody uses anymore
fn delete_icon_rows(conn: &Connection, icon_id: i64) -> Result<(), IndexError> {
    let tag_ids = {
        let mut stmt = conn
            .prepare_cached("SELECT tag_id FROM icon_to_tags WHERE icon_id = ?1")
            .context("Failed to list icon tags")?;
        let ids = stmt
            .query_map(params![icon_id], |row| row.get::<_, i64>(0))
            .context("Failed to list icon tags")?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("Failed to list icon tags")?;
        ids
    };

    conn.execute("DELETE FROM icon WHERE id = ?1", params![icon_id])
        .context("Failed to delete icon")?;

    for tag_id in tag_ids {
        delete_tag_if_unused(conn, tag_id)?;
    }
    Ok(())
}

#[async_trait]
impl IndexRepository for SqliteIndex {
    async fn describe_all_icons(&self) -> Result<Vec<IconDescriptor>, IndexError> {
        self.read("list icons", |conn| {
            let mut stmt = conn
                .prepare_cached("SELECT name FROM icon ORDER BY name")
                .context("Failed to list icons")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .context("Failed to list icons")?
                .collect::<rusqlite::Result<Vec<String>>>()
                .context("Failed to list icons")?;

            names.iter().map(|name| describe(conn, name)).collect()
        })
        .await
    }

    async fn describe_icon(&self, icon_name: &str) -> Result<IconDescriptor, IndexError> {
        self.read("describe icon", |conn| describe(conn, icon_name))
            .await
    }

    async fn get_existing_tags(&self) -> Result<Vec<String>, IndexError> {
        self.read("list tags", |conn| {
            let mut stmt = conn
                .prepare_cached("SELECT text FROM tag ORDER BY text")
                .context("Failed to list tags")?;
            let tags = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .context("Failed to list tags")?
                .collect::<rusqlite::Result<Vec<String>>>()
                .context("Failed to list tags")?;
            Ok(tags)
        })
        .await
    }

    async fn get_tags_with_counts(&self) -> Result<Vec<TagUsage>, IndexError> {
        self.read("count tags", |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT t.text, COUNT(it.icon_id) FROM tag t
                     LEFT JOIN icon_to_tags it ON it.tag_id = t.id
                     GROUP BY t.id ORDER BY t.text",
                )
                .context("Failed to count tags")?;
            let usage = stmt
                .query_map([], |row| {
                    Ok(TagUsage::new(
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?.max(0) as u64,
                    ))
                })
                .context("Failed to count tags")?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to count tags")?;
            Ok(usage)
        })
        .await
    }

    async fn create_icon(
        &self,
        icon_name: &str,
        iconfile: &IconfileDescriptor,
        modified_by: &str,
        side_effect: Option<SideEffect<'_>>,
    ) -> Result<(), IndexError> {
        self.write(
            "create icon",
            |conn| {
                let inserted = conn.execute(
                    "INSERT INTO icon (name, modified_by) VALUES (?1, ?2)",
                    params![icon_name, modified_by],
                );
                match inserted {
                    Ok(_) => {}
                    Err(e) if is_unique_violation(&e) => {
                        return Err(IndexError::IconAlreadyExists(icon_name.to_string()))
                    }
                    Err(e) => {
                        return Err(IndexError::Database {
                            context: format!("Failed to create icon {}", icon_name),
                            source: e,
                        })
                    }
                }
                insert_iconfile(conn, conn.last_insert_rowid(), icon_name, iconfile)
            },
            side_effect,
        )
        .await?;

        info!("Icon {} created with {}", icon_name, iconfile);
        Ok(())
    }

    async fn add_iconfile_to_icon(
        &self,
        icon_name: &str,
        iconfile: &IconfileDescriptor,
        modified_by: &str,
        side_effect: Option<SideEffect<'_>>,
    ) -> Result<(), IndexError> {
        self.write(
            "add iconfile",
            |conn| {
                let icon_id = require_icon_id(conn, icon_name)?;
                insert_iconfile(conn, icon_id, icon_name, iconfile)?;
                touch_icon(conn, icon_id, modified_by)
            },
            side_effect,
        )
        .await?;

        info!("Iconfile {} added to {}", iconfile, icon_name);
        Ok(())
    }

    async fn add_tag(
        &self,
        icon_name: &str,
        tag: &str,
        modified_by: &str,
    ) -> Result<(), IndexError> {
        self.write(
            "add tag",
            |conn| {
                let icon_id = require_icon_id(conn, icon_name)?;
                let tag_id = get_or_create_tag(conn, tag)?;

                let attached = conn
                    .query_row(
                        "SELECT 1 FROM icon_to_tags WHERE icon_id = ?1 AND tag_id = ?2",
                        params![icon_id, tag_id],
                        |_| Ok(()),
                    )
                    .optional()
                    .context("Failed to check tag")?
                    .is_some();
                if attached {
                    return Ok(());
                }

                conn.execute(
                    "INSERT INTO icon_to_tags (icon_id, tag_id) VALUES (?1, ?2)",
                    params![icon_id, tag_id],
                )
                .context(format!("Failed to tag {} with {}", icon_name, tag))?;
                touch_icon(conn, icon_id, modified_by)
            },
            None,
        )
        .await
    }

    async fn remove_tag(
        &self,
        icon_name: &str,
        tag: &str,
        modified_by: &str,
    ) -> Result<(), IndexError> {
        self.write(
            "remove tag",
            |conn| {
                let icon_id = require_icon_id(conn, icon_name)?;
                let Some(tag_id) = find_tag_id(conn, tag)? else {
                    return Ok(());
                };

                let removed = conn
                    .execute(
                        "DELETE FROM icon_to_tags WHERE icon_id = ?1 AND tag_id = ?2",
                        params![icon_id, tag_id],
                    )
                    .context(format!("Failed to remove tag {} from {}", tag, icon_name))?;
                if removed == 0 {
                    return Ok(());
                }

                delete_tag_if_unused(conn, tag_id)?;
                touch_icon(conn, icon_id, modified_by)
            },
            None,
        )
        .await
    }

    async fn delete_icon(
        &self,
        icon_name: &str,
        modified_by: &str,
        side_effect: Option<SideEffect<'_>>,
    ) -> Result<(), IndexError> {
        self.write(
            "delete icon",
            |conn| {
                let icon_id = require_icon_id(conn, icon_name)?;
                delete_icon_rows(conn, icon_id)
            },
            side_effect,
        )
        .await?;

        info!("Icon {} deleted by {}", icon_name, modified_by);
        Ok(())
    }

    async fn delete_iconfile(
        &self,
        icon_name: &str,
        iconfile: &IconfileDescriptor,
        modified_by: &str,
        side_effect: Option<SideEffect<'_>>,
    ) -> Result<(), IndexError> {
        let icon_deleted = self
            .write(
                "delete iconfile",
                |conn| {
                    let icon_id = require_icon_id(conn, icon_name)?;
                    let removed = conn
                        .execute(
                            "DELETE FROM icon_file
                             WHERE icon_id = ?1 AND file_format = ?2 AND icon_size = ?3",
                            params![icon_id, iconfile.format, iconfile.size],
                        )
                        .context(format!("Failed to delete iconfile {}", iconfile))?;
                    if removed == 0 {
                        return Err(IndexError::IconfileNotFound {
                            icon: icon_name.to_string(),
                            iconfile: iconfile.clone(),
                        });
                    }

                    let remaining: i64 = conn
                        .query_row(
                            "SELECT COUNT(*) FROM icon_file WHERE icon_id = ?1",
                            params![icon_id],
                            |row| row.get(0),
                        )
                        .context("Failed to count iconfiles")?;
                    if remaining == 0 {
                        delete_icon_rows(conn, icon_id)?;
                        return Ok(true);
                    }

                    touch_icon(conn, icon_id, modified_by)?;
                    Ok(false)
                },
                side_effect,
            )
            .await?;

        if icon_deleted {
            info!("Last iconfile {} removed, icon {} deleted", iconfile, icon_name);
        } else {
            info!("Iconfile {} deleted from {}", iconfile, icon_name);
        }
        Ok(())
    }
}
