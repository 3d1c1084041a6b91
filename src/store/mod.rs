//! Persistent state.
//!
//! A SQLite file holds users, chats, memberships, messages and the server
//! counters; a sibling directory holds posted file blobs. Access goes
//! through a readers/writer [`gate::Gate`] shared by every connection, one
//! connection per thread.

mod blobs;
mod gate;
mod repo;

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use rusqlite::Connection;
use rusqlite::OpenFlags;

pub(crate) use blobs::BlobDir;
use gate::Access;
use gate::Gate;
pub(crate) use gate::StoreError;
pub(crate) use repo::Connected;
pub(crate) use repo::Registration;
pub(crate) use repo::Repo;
pub(crate) use repo::Tally;

/// Handle to the store file and its gate. Cheap to share; actual
/// connections are opened per thread with [`Store::connect`].
pub(crate) struct Store {
    path: PathBuf,
    gate: Arc<Gate>,
}

impl Store {
    pub(crate) fn open(path: impl Into<PathBuf>) -> Store {
        Store {
            path: path.into(),
            gate: Arc::new(Gate::new()),
        }
    }

    /// Prepares the store for a run: creates the schema on first use, and
    /// otherwise force-disconnects every user left over from the previous
    /// run.
    pub(crate) fn init(&self) -> Result<(), StoreError> {
        let fresh = !self.path.exists();
        let conn = open_connection(&self.path).map_err(StoreError::Fatal)?;
        if fresh {
            self.gate
                .run(Access::classify(repo::SCHEMA), || {
                    conn.execute_batch(repo::SCHEMA)
                })?;
            info!("created store at {}", self.path.display());
        } else {
            self.gate.run(Access::classify(repo::RESET_FDS), || {
                conn.execute(repo::RESET_FDS, [])
            })?;
            info!("opened store at {}", self.path.display());
        }
        Ok(())
    }

    /// Opens a fresh connection sharing this store's gate.
    pub(crate) fn connect(&self) -> Result<Repo, StoreError> {
        let conn = open_connection(&self.path).map_err(StoreError::Fatal)?;
        Ok(Repo::new(conn, Arc::clone(&self.gate)))
    }

    /// Makes every pending and future statement fail fast.
    pub(crate) fn terminate(&self) {
        self.gate.terminate();
    }
}

fn open_connection(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
    )?;
    conn.busy_timeout(Duration::from_secs(1))?;
    // The pragma answers with the resulting mode, so it cannot go through
    // execute().
    conn.query_row("PRAGMA journal_mode = MEMORY", [], |_| Ok(()))?;
    // The `REFERENCES` clauses in the schema document relationships; they
    // are not meant to be enforced, since sentinel senders (`DELETED_USER`,
    // `LEFT_GROUP_USER`) are deliberately written to `messages.sent_by`
    // without a matching `users` row. Some SQLite builds default foreign
    // key enforcement on, so disable it explicitly.
    conn.execute("PRAGMA foreign_keys = OFF", [])?;
    Ok(conn)
}

#[cfg(test)]
mod test {
    use super::repo::DISCONNECTED_FD;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn init_resets_bindings_but_keeps_users() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chat.db");

        let store = Store::open(&path);
        store.init().unwrap();
        let repo = store.connect().unwrap();
        repo.insert_user("alice", 7).unwrap();
        assert_eq!(repo.user_fd("alice").unwrap(), Some(7));
        drop(repo);

        // A second start finds alice registered but disconnected.
        let store = Store::open(&path);
        store.init().unwrap();
        let repo = store.connect().unwrap();
        assert_eq!(repo.user_fd("alice").unwrap(), Some(DISCONNECTED_FD));
    }

    #[test]
    fn terminated_store_rejects_work() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("chat.db"));
        store.init().unwrap();
        let repo = store.connect().unwrap();
        store.terminate();
        assert!(matches!(
            repo.user_fd("alice"),
            Err(StoreError::Terminated)
        ));
    }
}
