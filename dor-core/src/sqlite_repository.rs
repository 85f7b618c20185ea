//! SQLite-backed key/value-table repository
//!
//! All state lives in one four-column table:
//!
//! ```text
//! OBJECTS(HANDLE, ELEMENT_NAME, ATTRIBUTE_NAME, VALUE)
//!   PRIMARY KEY (HANDLE, ELEMENT_NAME, ATTRIBUTE_NAME)
//! ```
//!
//! The empty string stands for "none": `(h, '', '', '')` records that object
//! `h` exists, `(h, el, '', '')` that it has element `el`, `(h, '', name, v)`
//! is an object attribute and `(h, el, name, v)` an element attribute.
//! Element payloads are plain files under a separate directory.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::encoding::encode_file_name;
use crate::error::{RepositoryError, Result};
use crate::object::{INTERNAL_CREATED, INTERNAL_MODIFIED, next_modified, now_millis, refreshes_modified};
use crate::query::{Query, QueryParams};
use crate::repository::{AttributeMap, AttributeUpdates, CloseableIter, Repository};
use crate::search::{self, SearchPrimitives};

fn open_objects_db(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS OBJECTS (
            HANDLE TEXT NOT NULL,
            ELEMENT_NAME TEXT NOT NULL,
            ATTRIBUTE_NAME TEXT NOT NULL,
            VALUE TEXT NOT NULL,
            PRIMARY KEY (HANDLE, ELEMENT_NAME, ATTRIBUTE_NAME)
        ) WITHOUT ROWID;
        CREATE INDEX IF NOT EXISTS OBJECTS_BY_VALUE ON OBJECTS (ATTRIBUTE_NAME, VALUE);",
    )?;
    Ok(())
}

fn row_exists(conn: &Connection, handle: &str, element: &str) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM OBJECTS WHERE HANDLE=?1 AND ELEMENT_NAME=?2 AND ATTRIBUTE_NAME=''",
            params![handle, element],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn require_object(conn: &Connection, handle: &str) -> Result<()> {
    if row_exists(conn, handle, "")? {
        Ok(())
    } else {
        Err(RepositoryError::ObjectNotFound(handle.to_string()))
    }
}

fn require_element(conn: &Connection, handle: &str, element: &str) -> Result<()> {
    require_object(conn, handle)?;
    if row_exists(conn, handle, element)? {
        Ok(())
    } else {
        Err(RepositoryError::element_not_found(handle, element))
    }
}

fn get_att(conn: &Connection, handle: &str, element: &str, name: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT VALUE FROM OBJECTS WHERE HANDLE=?1 AND ELEMENT_NAME=?2 AND ATTRIBUTE_NAME=?3",
            params![handle, element, name],
            |r| r.get(0),
        )
        .optional()?)
}

fn put_att(conn: &Connection, handle: &str, element: &str, name: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO OBJECTS (HANDLE, ELEMENT_NAME, ATTRIBUTE_NAME, VALUE) VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(HANDLE, ELEMENT_NAME, ATTRIBUTE_NAME) DO UPDATE SET VALUE=excluded.VALUE",
        params![handle, element, name, value],
    )?;
    Ok(())
}

fn del_att(conn: &Connection, handle: &str, element: &str, name: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM OBJECTS WHERE HANDLE=?1 AND ELEMENT_NAME=?2 AND ATTRIBUTE_NAME=?3",
        params![handle, element, name],
    )?;
    Ok(())
}

fn stamp_modified(conn: &Connection, handle: &str) -> Result<()> {
    let prev = get_att(conn, handle, "", INTERNAL_MODIFIED)?;
    put_att(conn, handle, "", INTERNAL_MODIFIED, &next_modified(prev.as_deref()))
}

fn handle_column(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(args, |r| r.get::<_, String>(0))?;
    let mut out = HashSet::new();
    for row in rows {
        out.insert(row?);
    }
    Ok(out)
}

/// Key/value-table repository over SQLite
pub struct SqliteRepository {
    conn: Mutex<Option<Connection>>,
    element_dir: PathBuf,
}

impl SqliteRepository {
    /// Open the database at `db_path`, keeping element payloads under `element_dir`
    pub fn open(db_path: &Path, element_dir: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        open_objects_db(&conn)?;
        fs::create_dir_all(element_dir)?;
        tracing::info!("Opened SQLite repository at {:?}", db_path);
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            element_dir: element_dir.to_path_buf(),
        })
    }

    /// Open a database next to its payload directory: `<root>/objects.sqlite`
    /// and `<root>/element-files/`
    pub fn open_dir(root: &Path) -> Result<Self> {
        Self::open(&root.join("objects.sqlite"), &root.join("element-files"))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| RepositoryError::Database("repository is closed".to_string()))?;
        f(conn)
    }

    fn object_files(&self, handle: &str) -> PathBuf {
        self.element_dir.join(encode_file_name(handle))
    }

    fn element_file(&self, handle: &str, name: &str) -> PathBuf {
        self.object_files(handle).join(encode_file_name(name))
    }
}

impl SearchPrimitives for SqliteRepository {
    fn all_handles(&self) -> Result<HashSet<String>> {
        self.with_conn(|conn| {
            handle_column(
                conn,
                "SELECT HANDLE FROM OBJECTS WHERE HANDLE!='' AND ELEMENT_NAME='' AND ATTRIBUTE_NAME=''",
                &[],
            )
        })
    }

    fn attribute_handles(&self, name: &str, value: &str) -> Result<HashSet<String>> {
        self.with_conn(|conn| {
            handle_column(
                conn,
                "SELECT HANDLE FROM OBJECTS WHERE ELEMENT_NAME='' AND ATTRIBUTE_NAME=?1 AND VALUE=?2",
                &[&name, &value],
            )
        })
    }

    fn element_attribute_handles(&self, element: &str, name: &str, value: &str) -> Result<HashSet<String>> {
        self.with_conn(|conn| {
            handle_column(
                conn,
                "SELECT HANDLE FROM OBJECTS WHERE ELEMENT_NAME=?1 AND ATTRIBUTE_NAME=?2 AND VALUE=?3",
                &[&element, &name, &value],
            )
        })
    }
}

impl Repository for SqliteRepository {
    fn verify_object(&self, handle: &str) -> Result<bool> {
        self.with_conn(|conn| row_exists(conn, handle, ""))
    }

    fn create_object(&self, handle: Option<&str>) -> Result<String> {
        let handle = match handle {
            Some(h) => h.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if row_exists(&tx, &handle, "")? {
                return Err(RepositoryError::ObjectExists(handle.clone()));
            }
            let now = now_millis().to_string();
            put_att(&tx, &handle, "", "", "")?;
            put_att(&tx, &handle, "", INTERNAL_CREATED, &now)?;
            put_att(&tx, &handle, "", INTERNAL_MODIFIED, &now)?;
            tx.commit()?;
            Ok(())
        })?;
        Ok(handle)
    }

    fn delete_object(&self, handle: &str) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            require_object(&tx, handle)?;
            tx.execute("DELETE FROM OBJECTS WHERE HANDLE=?1", params![handle])?;
            tx.commit()?;
            Ok(())
        })?;
        match fs::remove_dir_all(self.object_files(handle)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn list_handles(&self) -> Result<CloseableIter<String>> {
        let handles = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT HANDLE FROM OBJECTS WHERE HANDLE!='' AND ELEMENT_NAME='' AND ATTRIBUTE_NAME='' \
                 ORDER BY HANDLE",
            )?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;
        Ok(Box::new(handles.into_iter().map(Ok)))
    }

    fn search_handles(&self, query: &Query, params: &QueryParams) -> Result<CloseableIter<String>> {
        let hits = search::evaluate(self, query)?;
        let ordered = search::sort_and_page(hits, params, |h, name| self.attribute(h, None, name))?;
        Ok(Box::new(ordered.into_iter().map(Ok)))
    }

    fn attributes(&self, handle: &str, element: Option<&str>) -> Result<AttributeMap> {
        let element = element.unwrap_or_default();
        self.with_conn(|conn| {
            if element.is_empty() {
                require_object(conn, handle)?;
            } else {
                require_element(conn, handle, element)?;
            }
            let mut stmt = conn.prepare_cached(
                "SELECT ATTRIBUTE_NAME, VALUE FROM OBJECTS \
                 WHERE HANDLE=?1 AND ELEMENT_NAME=?2 AND ATTRIBUTE_NAME!=''",
            )?;
            let rows = stmt.query_map(params![handle, element], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?;
            let mut out = AttributeMap::new();
            for row in rows {
                let (k, v) = row?;
                out.insert(k, v);
            }
            Ok(out)
        })
    }

    fn attribute(&self, handle: &str, element: Option<&str>, name: &str) -> Result<Option<String>> {
        let element = element.unwrap_or_default();
        self.with_conn(|conn| {
            if element.is_empty() {
                require_object(conn, handle)?;
            } else {
                require_element(conn, handle, element)?;
            }
            get_att(conn, handle, element, name)
        })
    }

    fn set_attributes(&self, handle: &str, element: Option<&str>, updates: &AttributeUpdates) -> Result<()> {
        let element = element.unwrap_or_default();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if element.is_empty() {
                require_object(&tx, handle)?;
            } else {
                require_element(&tx, handle, element)?;
            }
            for (name, value) in updates {
                if name.is_empty() {
                    continue;
                }
                match value {
                    Some(v) => put_att(&tx, handle, element, name, v)?,
                    None => del_att(&tx, handle, element, name)?,
                }
            }
            if refreshes_modified(updates.keys().map(String::as_str)) {
                stamp_modified(&tx, handle)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn verify_element(&self, handle: &str, name: &str) -> Result<bool> {
        self.with_conn(|conn| {
            require_object(conn, handle)?;
            row_exists(conn, handle, name)
        })
    }

    fn create_element(&self, handle: &str, name: &str) -> Result<()> {
        let path = self.element_file(handle, name);
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            require_object(&tx, handle)?;
            if row_exists(&tx, handle, name)? {
                return Err(RepositoryError::element_exists(handle, name));
            }
            put_att(&tx, handle, name, "", "")?;
            stamp_modified(&tx, handle)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            File::create(&path)?;
            tx.commit()?;
            Ok(())
        })
    }

    fn delete_element(&self, handle: &str, name: &str) -> Result<()> {
        let path = self.element_file(handle, name);
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            require_element(&tx, handle, name)?;
            tx.execute(
                "DELETE FROM OBJECTS WHERE HANDLE=?1 AND ELEMENT_NAME=?2",
                params![handle, name],
            )?;
            stamp_modified(&tx, handle)?;
            tx.commit()?;
            Ok(())
        })?;
        match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn list_elements(&self, handle: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            require_object(conn, handle)?;
            let mut stmt = conn.prepare_cached(
                "SELECT ELEMENT_NAME FROM OBJECTS \
                 WHERE HANDLE=?1 AND ELEMENT_NAME!='' AND ATTRIBUTE_NAME='' ORDER BY ELEMENT_NAME",
            )?;
            let rows = stmt.query_map(params![handle], |r| r.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn read_element(&self, handle: &str, name: &str) -> Result<Box<dyn Read + Send>> {
        self.with_conn(|conn| require_element(conn, handle, name))?;
        match File::open(self.element_file(handle, name)) {
            Ok(f) => Ok(Box::new(f)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Box::new(io::empty())),
            Err(e) => Err(e.into()),
        }
    }

    fn write_element(&self, handle: &str, name: &str, data: &mut dyn Read, append: bool) -> Result<u64> {
        let path = self.element_file(handle, name);
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            require_element(&tx, handle, name)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .append(append)
                .truncate(!append)
                .open(&path)?;
            let written = io::copy(data, &mut file)?;
            stamp_modified(&tx, handle)?;
            tx.commit()?;
            Ok(written)
        })
    }

    fn element_size(&self, handle: &str, name: &str) -> Result<u64> {
        self.with_conn(|conn| require_element(conn, handle, name))?;
        match fs::metadata(self.element_file(handle, name)) {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().take() {
            conn.close().map_err(|(_, e)| RepositoryError::from(e))?;
            tracing::info!("Closed SQLite repository");
        }
        Ok(())
    }
}
