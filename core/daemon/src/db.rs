//! SQLite persistence for iconwear-daemon.
//!
//! Wear data is stored as key-value groups: one row per (app id, field). Each
//! save clears the table and rewrites the whole snapshot in one transaction,
//! so readers never observe a half-written namespace.

use rusqlite::{params, Connection, OpenFlags};
use std::path::PathBuf;

use crate::error::PersistError;
use crate::persist::{FieldGroups, WearBackend};

pub struct SqliteBackend {
    path: PathBuf,
}

impl SqliteBackend {
    pub fn new(path: PathBuf) -> Result<Self, PersistError> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), PersistError> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS wear_fields (
                    app_id TEXT NOT NULL,
                    field TEXT NOT NULL,
                    value TEXT NOT NULL,
                    PRIMARY KEY (app_id, field)
                 );
                 COMMIT;",
            )
            .map_err(PersistError::sqlite("initialize schema"))
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, PersistError>,
    ) -> Result<T, PersistError> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, PersistError> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent).map_err(|source| PersistError::DataDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(PersistError::sqlite("open sqlite db"))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(PersistError::sqlite("enable WAL"))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(PersistError::sqlite("set synchronous"))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(PersistError::sqlite("set busy_timeout"))?;

        Ok(conn)
    }
}

impl WearBackend for SqliteBackend {
    fn load_groups(&self) -> Result<FieldGroups, PersistError> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT app_id, field, value FROM wear_fields ORDER BY app_id, field")
                .map_err(PersistError::sqlite("prepare wear query"))?;

            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(PersistError::sqlite("read wear rows"))?;

            let mut groups = FieldGroups::new();
            for row in rows {
                match row {
                    Ok((app_id, field, value)) => {
                        groups.entry(app_id).or_default().insert(field, value);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "Skipping undecodable wear row");
                    }
                }
            }

            Ok(groups)
        })
    }

    fn replace_all(&self, groups: &FieldGroups) -> Result<(), PersistError> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(PersistError::sqlite("begin wear rewrite"))?;
            tx.execute("DELETE FROM wear_fields", [])
                .map_err(PersistError::sqlite("clear wear fields"))?;
            {
                let mut stmt = tx
                    .prepare("INSERT INTO wear_fields (app_id, field, value) VALUES (?1, ?2, ?3)")
                    .map_err(PersistError::sqlite("prepare wear insert"))?;
                for (app_id, fields) in groups {
                    for (field, value) in fields {
                        stmt.execute(params![app_id, field, value])
                            .map_err(PersistError::sqlite("insert wear field"))?;
                    }
                }
            }
            tx.commit()
                .map_err(PersistError::sqlite("commit wear rewrite"))?;
            Ok(())
        })
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }
}
