//! Server statistics.

use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// A point-in-time snapshot of the server counters.
///
/// The delivery and error counters are persistent and only ever grow;
/// `users` and `online` are derived from the current user table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Registered users.
    pub users: u64,
    /// Users currently bound to a connection.
    pub online: u64,
    /// Text messages written to an online recipient.
    pub delivered_txt: u64,
    /// Text messages stored for an offline recipient or lost to a failed
    /// write.
    pub not_delivered_txt: u64,
    /// File notifications written to an online recipient.
    pub delivered_file: u64,
    /// File notifications stored for an offline recipient or lost to a
    /// failed write.
    pub not_delivered_file: u64,
    /// Error acknowledgements sent.
    pub errors: u64,
}

impl Stats {
    /// Appends this snapshot as one line to the file at `path`, creating
    /// the file if needed.
    pub fn append_to(&self, path: &Path) -> io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{self}")
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        write!(
            f,
            "{} - {} {} {} {} {} {} {}",
            now,
            self.users,
            self.online,
            self.delivered_txt,
            self.not_delivered_txt,
            self.delivered_file,
            self.not_delivered_file,
            self.errors,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn appends_one_line_per_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.txt");
        let stats = Stats {
            users: 3,
            online: 2,
            delivered_txt: 10,
            not_delivered_txt: 1,
            delivered_file: 4,
            not_delivered_file: 0,
            errors: 5,
        };
        stats.append_to(&path).unwrap();
        stats.append_to(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("- 3 2 10 1 4 0 5"));
    }
}
