//! Shared connection table.
//!
//! Live client connections keyed by their raw descriptor. The dispatcher
//! snapshots the table to build its readable set; workers look up write
//! handles when delivering. Removing an entry is the single close point:
//! the underlying descriptor closes when the last `Arc` clone drops, so a
//! descriptor is never closed while another thread still holds it.

use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use parking_lot::Mutex;

pub(crate) struct ConnTable {
    conns: Mutex<HashMap<RawFd, Arc<UnixStream>>>,
}

impl ConnTable {
    pub(crate) fn new() -> ConnTable {
        ConnTable {
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a freshly accepted connection and returns its descriptor
    /// together with the shared handle.
    pub(crate) fn insert(&self, stream: UnixStream) -> (RawFd, Arc<UnixStream>) {
        let fd = stream.as_raw_fd();
        let stream = Arc::new(stream);
        self.conns.lock().insert(fd, Arc::clone(&stream));
        (fd, stream)
    }

    pub(crate) fn get(&self, fd: RawFd) -> Option<Arc<UnixStream>> {
        self.conns.lock().get(&fd).cloned()
    }

    pub(crate) fn contains(&self, fd: RawFd) -> bool {
        self.conns.lock().contains_key(&fd)
    }

    /// Drops the table's reference to `fd`. Returns whether it was present.
    pub(crate) fn remove(&self, fd: RawFd) -> bool {
        self.conns.lock().remove(&fd).is_some()
    }

    /// Drops every reference; remaining descriptors close as their last
    /// holders go away.
    pub(crate) fn clear(&self) {
        self.conns.lock().clear();
    }
}
