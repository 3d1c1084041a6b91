//! Domain operations over the relational store.
//!
//! One [`Repo`] per thread, each with its own connection; cross-thread
//! consistency comes from the shared [`Gate`]. Every method is a small set
//! of parameterized statements, classified by their leading keyword.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;

use super::gate::Access;
use super::gate::Gate;
use super::gate::StoreError;
use crate::ll::abi;
use crate::ll::abi::Op;
use crate::stats::Stats;

/// `curr_fd` value of a user with no live connection.
pub(crate) const DISCONNECTED_FD: RawFd = -1;

/// Sender recorded on messages whose author unregistered.
pub(crate) const DELETED_USER: &str = "#deleted_user";

/// Sender recorded on group messages whose author left the group.
pub(crate) const LEFT_GROUP_USER: &str = "#user_no_more_in_group";

pub(crate) const SCHEMA: &str = "\
CREATE TABLE users (
    username TEXT PRIMARY KEY,
    curr_fd  INTEGER NOT NULL
);
CREATE TABLE chats (
    chat_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_name TEXT UNIQUE,
    creator   TEXT REFERENCES users (username)
);
CREATE TABLE chat_members (
    chat_id  INTEGER NOT NULL REFERENCES chats (chat_id),
    username TEXT NOT NULL REFERENCES users (username),
    PRIMARY KEY (chat_id, username)
);
CREATE TABLE messages (
    message_id INTEGER PRIMARY KEY AUTOINCREMENT,
    body       TEXT,
    filename   TEXT,
    sent_by    TEXT NOT NULL REFERENCES users (username),
    chat_id    INTEGER NOT NULL REFERENCES chats (chat_id),
    sent_time  TEXT NOT NULL
);
CREATE TABLE stats (
    not_delivered_txt  INTEGER NOT NULL,
    not_delivered_file INTEGER NOT NULL,
    delivered_txt      INTEGER NOT NULL,
    delivered_file     INTEGER NOT NULL,
    error_count        INTEGER NOT NULL
);
INSERT INTO stats VALUES (0, 0, 0, 0, 0);
";

/// Run at every non-first start: whatever the previous run left behind,
/// nobody is connected now.
pub(crate) const RESET_FDS: &str = "UPDATE users SET curr_fd = -1";

const NAME_EXISTS: &str = "\
SELECT (SELECT COUNT(*) FROM users WHERE username = ?1)
     + (SELECT COUNT(*) FROM chats WHERE chat_name = ?1)";

const INSERT_USER: &str = "INSERT INTO users (username, curr_fd) VALUES (?1, ?2)";

const USER_FD: &str = "SELECT curr_fd FROM users WHERE username = ?1";

const CONNECT_USER: &str = "UPDATE users SET curr_fd = ?1 WHERE username = ?2 AND curr_fd = -1";

const DISCONNECT_FD: &str = "UPDATE users SET curr_fd = -1 WHERE curr_fd = ?1";

const DELETE_USER: &str = "DELETE FROM users WHERE username = ?1";
const DELETE_USER_MEMBERSHIPS: &str = "DELETE FROM chat_members WHERE username = ?1";
const ORPHAN_USER_MESSAGES: &str = "UPDATE messages SET sent_by = ?2 WHERE sent_by = ?1";

const CREATE_PEER_CHAT: &str = "INSERT INTO chats (chat_name) VALUES (NULL)";

const CREATE_GROUP: &str = "INSERT INTO chats (chat_name, creator) VALUES (?1, ?2)";

const GROUP_ID: &str = "SELECT chat_id FROM chats WHERE chat_name = ?1";

const GROUP_CREATOR: &str = "SELECT chat_id, creator FROM chats WHERE chat_name = ?1";

const INSERT_MEMBER: &str = "INSERT INTO chat_members (chat_id, username) VALUES (?1, ?2)";

const IS_MEMBER: &str = "SELECT COUNT(*) FROM chat_members WHERE chat_id = ?1 AND username = ?2";

const PEER_CHAT_ID: &str = "\
SELECT c.chat_id
FROM chats c
JOIN chat_members a ON a.chat_id = c.chat_id AND a.username = ?1
JOIN chat_members b ON b.chat_id = c.chat_id AND b.username = ?2
WHERE c.chat_name IS NULL
LIMIT 1";

const INSERT_TEXT: &str = "\
INSERT INTO messages (body, filename, sent_by, chat_id, sent_time)
VALUES (?1, NULL, ?2, ?3, datetime('now'))";

const INSERT_FILE: &str = "\
INSERT INTO messages (body, filename, sent_by, chat_id, sent_time)
VALUES (NULL, ?1, ?2, ?3, datetime('now'))";

const ONLINE_FDS: &str = "SELECT curr_fd FROM users WHERE curr_fd >= 0";

const ONLINE_FDS_IN_CHAT: &str = "\
SELECT u.curr_fd
FROM users u
JOIN chat_members m ON m.username = u.username
WHERE m.chat_id = ?1 AND u.curr_fd >= 0";

const ONLINE_USERNAMES: &str =
    "SELECT username FROM users WHERE curr_fd >= 0 ORDER BY username ASC";

const ALL_USERNAMES: &str = "SELECT username FROM users";

const DELETE_GROUP_MESSAGES: &str = "DELETE FROM messages WHERE chat_id = ?1";
const DELETE_GROUP_MEMBERS: &str = "DELETE FROM chat_members WHERE chat_id = ?1";
const DELETE_GROUP_CHAT: &str = "DELETE FROM chats WHERE chat_id = ?1";

const REMOVE_MEMBER: &str = "DELETE FROM chat_members WHERE chat_id = ?1 AND username = ?2";
const ORPHAN_MEMBER_MESSAGES: &str =
    "UPDATE messages SET sent_by = ?3 WHERE chat_id = ?1 AND sent_by = ?2";

const RECENT_MESSAGES: &str = "\
SELECT m.body, m.filename, m.sent_by
FROM messages m
JOIN chat_members cm ON cm.chat_id = m.chat_id
WHERE cm.username = ?1 AND m.sent_by <> ?1
ORDER BY m.sent_time DESC, m.message_id DESC
LIMIT ?2";

const FILE_MESSAGE_ID: &str = "\
SELECT m.message_id
FROM messages m
JOIN chat_members cm ON cm.chat_id = m.chat_id
WHERE cm.username = ?1 AND m.filename = ?2
ORDER BY m.sent_time DESC, m.message_id DESC
LIMIT 1";

const BUMP_STATS: &str = "\
UPDATE stats SET
    not_delivered_txt  = not_delivered_txt + ?1,
    not_delivered_file = not_delivered_file + ?2,
    delivered_txt      = delivered_txt + ?3,
    delivered_file     = delivered_file + ?4,
    error_count        = error_count + ?5";

const READ_STATS: &str = "\
SELECT not_delivered_txt, not_delivered_file, delivered_txt, delivered_file, error_count
FROM stats LIMIT 1";

const COUNT_USERS: &str = "SELECT COUNT(*) FROM users";
const COUNT_ONLINE: &str = "SELECT COUNT(*) FROM users WHERE curr_fd >= 0";

/// Outcome of a registration attempt.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Registration {
    Ok,
    NameTaken,
    Invalid,
}

/// Outcome of a connect attempt.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Connected {
    Ok,
    Unknown,
    Busy,
}

/// One record returned by [`Repo::recent_messages`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HistoryEntry {
    pub(crate) op: Op,
    pub(crate) sender: String,
    pub(crate) body: String,
}

/// Counter increments accumulated while serving one request.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Tally {
    pub(crate) delivered_txt: u64,
    pub(crate) not_delivered_txt: u64,
    pub(crate) delivered_file: u64,
    pub(crate) not_delivered_file: u64,
    pub(crate) errors: u64,
}

impl Tally {
    fn is_empty(&self) -> bool {
        self.delivered_txt == 0
            && self.not_delivered_txt == 0
            && self.delivered_file == 0
            && self.not_delivered_file == 0
            && self.errors == 0
    }
}

/// One thread's view of the store.
pub(crate) struct Repo {
    conn: Connection,
    gate: Arc<Gate>,
}

impl Repo {
    pub(crate) fn new(conn: Connection, gate: Arc<Gate>) -> Repo {
        Repo { conn, gate }
    }

    fn read<T>(&self, sql: &str, op: impl FnMut() -> rusqlite::Result<T>) -> Result<T, StoreError> {
        debug_assert_eq!(Access::classify(sql), Access::Read);
        self.gate.run(Access::classify(sql), op)
    }

    fn write<T>(
        &self,
        sql: &str,
        op: impl FnMut() -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        debug_assert_eq!(Access::classify(sql), Access::Write);
        self.gate.run(Access::classify(sql), op)
    }

    fn name_exists(&self, name: &str) -> Result<bool, StoreError> {
        let hits: i64 = self.read(NAME_EXISTS, || {
            self.conn.query_row(NAME_EXISTS, params![name], |r| r.get(0))
        })?;
        Ok(hits > 0)
    }

    /// Registers `name`, already bound to `fd`. Any stale binding of `fd`
    /// is cleared first so no descriptor ever maps to two users.
    pub(crate) fn insert_user(&self, name: &str, fd: RawFd) -> Result<Registration, StoreError> {
        if !abi::valid_username(name) {
            return Ok(Registration::Invalid);
        }
        if self.name_exists(name)? {
            return Ok(Registration::NameTaken);
        }
        self.disconnect_fd(fd)?;
        match self.write(INSERT_USER, || {
            self.conn.execute(INSERT_USER, params![name, fd])
        }) {
            Ok(_) => Ok(Registration::Ok),
            Err(StoreError::Constraint) => Ok(Registration::NameTaken),
            Err(e) => Err(e),
        }
    }

    /// Deletes `name`, its memberships, and marks its messages as coming
    /// from a deleted user. Returns whether the user existed.
    pub(crate) fn remove_user(&self, name: &str) -> Result<bool, StoreError> {
        self.write(DELETE_USER, || {
            let removed = self.conn.execute(DELETE_USER, params![name])?;
            self.conn.execute(DELETE_USER_MEMBERSHIPS, params![name])?;
            self.conn
                .execute(ORPHAN_USER_MESSAGES, params![name, DELETED_USER])?;
            Ok(removed > 0)
        })
    }

    /// Current descriptor of `name`: `None` if unknown,
    /// [`DISCONNECTED_FD`] if offline.
    pub(crate) fn user_fd(&self, name: &str) -> Result<Option<RawFd>, StoreError> {
        self.read(USER_FD, || {
            self.conn
                .query_row(USER_FD, params![name], |r| r.get(0))
                .optional()
        })
    }

    /// Binds `name` to `fd` if the user exists and is not connected
    /// elsewhere. Reconnecting on the same descriptor succeeds without a
    /// transition.
    pub(crate) fn connect_user(&self, name: &str, fd: RawFd) -> Result<Connected, StoreError> {
        match self.user_fd(name)? {
            None => Ok(Connected::Unknown),
            Some(current) if current == fd => Ok(Connected::Ok),
            Some(current) if current != DISCONNECTED_FD => Ok(Connected::Busy),
            Some(_) => {
                // The descriptor may still carry a stale binding.
                self.disconnect_fd(fd)?;
                let changed = self.write(CONNECT_USER, || {
                    self.conn.execute(CONNECT_USER, params![fd, name])
                })?;
                Ok(if changed == 1 {
                    Connected::Ok
                } else {
                    Connected::Busy
                })
            }
        }
    }

    /// Marks whoever is bound to `fd` (0 or 1 users) as disconnected.
    pub(crate) fn disconnect_fd(&self, fd: RawFd) -> Result<(), StoreError> {
        self.write(DISCONNECT_FD, || {
            self.conn.execute(DISCONNECT_FD, params![fd])
        })?;
        Ok(())
    }

    fn create_peer_chat(&self) -> Result<i64, StoreError> {
        self.write(CREATE_PEER_CHAT, || {
            self.conn.execute(CREATE_PEER_CHAT, [])?;
            Ok(self.conn.last_insert_rowid())
        })
    }

    /// Chat id of the nameless chat containing both users, if any.
    pub(crate) fn peer_chat_id(&self, a: &str, b: &str) -> Result<Option<i64>, StoreError> {
        self.read(PEER_CHAT_ID, || {
            self.conn
                .query_row(PEER_CHAT_ID, params![a, b], |r| r.get(0))
                .optional()
        })
    }

    /// Looks up the peer chat of `a` and `b`, creating it (with both
    /// memberships) on first contact.
    pub(crate) fn ensure_peer_chat(&self, a: &str, b: &str) -> Result<i64, StoreError> {
        if let Some(id) = self.peer_chat_id(a, b)? {
            return Ok(id);
        }
        let id = self.create_peer_chat()?;
        self.insert_member(id, a)?;
        self.insert_member(id, b)?;
        Ok(id)
    }

    /// Creates a named group owned by `creator`, who becomes its first
    /// member. Returns `None` when the name collides with a user or group.
    pub(crate) fn create_group(
        &self,
        name: &str,
        creator: &str,
    ) -> Result<Option<i64>, StoreError> {
        if self.name_exists(name)? {
            return Ok(None);
        }
        let id = match self.write(CREATE_GROUP, || {
            self.conn.execute(CREATE_GROUP, params![name, creator])?;
            Ok(self.conn.last_insert_rowid())
        }) {
            Ok(id) => id,
            Err(StoreError::Constraint) => return Ok(None),
            Err(e) => return Err(e),
        };
        self.insert_member(id, creator)?;
        Ok(Some(id))
    }

    /// Chat id of the group called `name`, if any.
    pub(crate) fn group_id(&self, name: &str) -> Result<Option<i64>, StoreError> {
        self.read(GROUP_ID, || {
            self.conn
                .query_row(GROUP_ID, params![name], |r| r.get(0))
                .optional()
        })
    }

    /// Adds `user` to a chat. Returns `false` if already a member.
    pub(crate) fn insert_member(&self, chat_id: i64, user: &str) -> Result<bool, StoreError> {
        match self.write(INSERT_MEMBER, || {
            self.conn.execute(INSERT_MEMBER, params![chat_id, user])
        }) {
            Ok(_) => Ok(true),
            Err(StoreError::Constraint) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn is_member(&self, chat_id: i64, user: &str) -> Result<bool, StoreError> {
        let hits: i64 = self.read(IS_MEMBER, || {
            self.conn
                .query_row(IS_MEMBER, params![chat_id, user], |r| r.get(0))
        })?;
        Ok(hits > 0)
    }

    /// Records a text message; returns its id.
    pub(crate) fn insert_text(
        &self,
        sender: &str,
        text: &str,
        chat_id: i64,
    ) -> Result<i64, StoreError> {
        self.write(INSERT_TEXT, || {
            self.conn
                .execute(INSERT_TEXT, params![text, sender, chat_id])?;
            Ok(self.conn.last_insert_rowid())
        })
    }

    /// Records a file message; the returned id keys the stored blob.
    pub(crate) fn insert_file(
        &self,
        sender: &str,
        filename: &str,
        chat_id: i64,
    ) -> Result<i64, StoreError> {
        self.write(INSERT_FILE, || {
            self.conn
                .execute(INSERT_FILE, params![filename, sender, chat_id])?;
            Ok(self.conn.last_insert_rowid())
        })
    }

    /// Descriptors of every online user. A snapshot; callers must tolerate
    /// staleness.
    pub(crate) fn online_fds(&self) -> Result<Vec<RawFd>, StoreError> {
        self.read(ONLINE_FDS, || {
            let mut stmt = self.conn.prepare(ONLINE_FDS)?;
            let rows = stmt.query_map([], |r| r.get(0))?;
            rows.collect()
        })
    }

    /// Descriptors of the online members of a chat. A snapshot.
    pub(crate) fn online_fds_in_chat(&self, chat_id: i64) -> Result<Vec<RawFd>, StoreError> {
        self.read(ONLINE_FDS_IN_CHAT, || {
            let mut stmt = self.conn.prepare(ONLINE_FDS_IN_CHAT)?;
            let rows = stmt.query_map(params![chat_id], |r| r.get(0))?;
            rows.collect()
        })
    }

    /// Names of every online user, alphabetically. A snapshot.
    pub(crate) fn online_usernames(&self) -> Result<Vec<String>, StoreError> {
        self.read(ONLINE_USERNAMES, || {
            let mut stmt = self.conn.prepare(ONLINE_USERNAMES)?;
            let rows = stmt.query_map([], |r| r.get(0))?;
            rows.collect()
        })
    }

    /// Names of every registered user.
    pub(crate) fn all_usernames(&self) -> Result<Vec<String>, StoreError> {
        self.read(ALL_USERNAMES, || {
            let mut stmt = self.conn.prepare(ALL_USERNAMES)?;
            let rows = stmt.query_map([], |r| r.get(0))?;
            rows.collect()
        })
    }

    /// Deletes the group `name` with its messages and memberships, but
    /// only when `requester` created it. Returns whether it happened.
    pub(crate) fn delete_group(&self, requester: &str, name: &str) -> Result<bool, StoreError> {
        let row: Option<(i64, Option<String>)> = self.read(GROUP_CREATOR, || {
            self.conn
                .query_row(GROUP_CREATOR, params![name], |r| Ok((r.get(0)?, r.get(1)?)))
                .optional()
        })?;
        let Some((chat_id, Some(creator))) = row else {
            return Ok(false);
        };
        if creator != requester {
            return Ok(false);
        }
        self.write(DELETE_GROUP_MESSAGES, || {
            self.conn.execute(DELETE_GROUP_MESSAGES, params![chat_id])?;
            self.conn.execute(DELETE_GROUP_MEMBERS, params![chat_id])?;
            self.conn.execute(DELETE_GROUP_CHAT, params![chat_id])?;
            Ok(())
        })?;
        Ok(true)
    }

    /// Removes `user` from a group and marks the messages it sent there as
    /// coming from a departed member.
    pub(crate) fn remove_from_group(&self, chat_id: i64, user: &str) -> Result<(), StoreError> {
        self.write(REMOVE_MEMBER, || {
            self.conn.execute(REMOVE_MEMBER, params![chat_id, user])?;
            self.conn.execute(
                ORPHAN_MEMBER_MESSAGES,
                params![chat_id, user, LEFT_GROUP_USER],
            )?;
            Ok(())
        })
    }

    /// The most recent `max` messages addressed to `receiver`, newest
    /// first, excluding the ones it sent itself.
    pub(crate) fn recent_messages(
        &self,
        receiver: &str,
        max: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        self.read(RECENT_MESSAGES, || {
            let mut stmt = self.conn.prepare(RECENT_MESSAGES)?;
            let rows = stmt.query_map(params![receiver, max as i64], |r| {
                let body: Option<String> = r.get(0)?;
                let filename: Option<String> = r.get(1)?;
                let sender: String = r.get(2)?;
                Ok(match body {
                    Some(text) => HistoryEntry {
                        op: Op::TxtMessage,
                        sender,
                        body: text,
                    },
                    None => HistoryEntry {
                        op: Op::FileMessage,
                        sender,
                        body: filename.unwrap_or_default(),
                    },
                })
            })?;
            rows.collect()
        })
    }

    /// Id of the most recent file called `filename` in any chat `receiver`
    /// belongs to.
    pub(crate) fn file_message_id(
        &self,
        receiver: &str,
        filename: &str,
    ) -> Result<Option<i64>, StoreError> {
        self.read(FILE_MESSAGE_ID, || {
            self.conn
                .query_row(FILE_MESSAGE_ID, params![receiver, filename], |r| r.get(0))
                .optional()
        })
    }

    /// Adds a request's counter increments to the persistent totals.
    pub(crate) fn bump_stats(&self, tally: &Tally) -> Result<(), StoreError> {
        if tally.is_empty() {
            return Ok(());
        }
        self.write(BUMP_STATS, || {
            self.conn.execute(
                BUMP_STATS,
                params![
                    tally.not_delivered_txt as i64,
                    tally.not_delivered_file as i64,
                    tally.delivered_txt as i64,
                    tally.delivered_file as i64,
                    tally.errors as i64,
                ],
            )
        })?;
        Ok(())
    }

    /// A point-in-time snapshot of all counters.
    pub(crate) fn stats(&self) -> Result<Stats, StoreError> {
        let (ndt, ndf, dt, df, errors) = self.read(READ_STATS, || {
            self.conn.query_row(READ_STATS, [], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
            })
        })?;
        let users: u64 = self.read(COUNT_USERS, || {
            self.conn.query_row(COUNT_USERS, [], |r| r.get(0))
        })?;
        let online: u64 = self.read(COUNT_ONLINE, || {
            self.conn.query_row(COUNT_ONLINE, [], |r| r.get(0))
        })?;
        Ok(Stats {
            users,
            online,
            delivered_txt: dt,
            not_delivered_txt: ndt,
            delivered_file: df,
            not_delivered_file: ndf,
            errors,
        })
    }
}
