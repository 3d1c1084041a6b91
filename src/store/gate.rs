//! Readers/writer gate in front of the store.
//!
//! Any number of statements may read concurrently, but writes run one at a
//! time with nothing else active. The leading SQL keyword decides which
//! side a statement takes. A termination flag makes both sides fail fast so
//! shutdown never parks on the store.

use std::error;
use std::fmt;

use parking_lot::Condvar;
use parking_lot::Mutex;

/// Lock mode a statement takes on the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
}

impl Access {
    /// Classifies a statement by its leading keyword: `SELECT` reads,
    /// `INSERT`/`UPDATE`/`DELETE`/`CREATE` write.
    pub(crate) fn classify(sql: &str) -> Access {
        match sql.trim_start().bytes().next().map(|b| b.to_ascii_uppercase()) {
            Some(b'S') => Access::Read,
            _ => Access::Write,
        }
    }
}

/// Errors coming out of the store.
#[derive(Debug)]
pub(crate) enum StoreError {
    /// A uniqueness or integrity constraint rejected the statement.
    Constraint,
    /// The gate is terminated; the server is shutting down.
    Terminated,
    /// Any other backend failure. These are not recoverable.
    Fatal(rusqlite::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Constraint => write!(f, "constraint violation"),
            StoreError::Terminated => write!(f, "store is shutting down"),
            StoreError::Fatal(e) => write!(f, "store failure: {e}"),
        }
    }
}

impl error::Error for StoreError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            StoreError::Fatal(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Default)]
struct GateState {
    readers: usize,
    writing: bool,
    terminated: bool,
}

pub(crate) struct Gate {
    state: Mutex<GateState>,
    turn: Condvar,
}

enum Settled<T> {
    Done(Result<T, StoreError>),
    Retry,
}

impl Gate {
    pub(crate) fn new() -> Gate {
        Gate {
            state: Mutex::new(GateState::default()),
            turn: Condvar::new(),
        }
    }

    /// Makes both sides fail fast and wakes every waiter.
    pub(crate) fn terminate(&self) {
        let mut state = self.state.lock();
        state.terminated = true;
        self.turn.notify_all();
    }

    /// Runs `op` under the requested access mode. A BUSY or LOCKED answer
    /// from the backend is retried once; constraint violations map to
    /// [`StoreError::Constraint`]; everything else is fatal.
    pub(crate) fn run<T>(
        &self,
        access: Access,
        op: impl FnMut() -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        match access {
            Access::Read => self.run_read(op),
            Access::Write => self.run_write(op),
        }
    }

    fn run_read<T>(&self, mut op: impl FnMut() -> rusqlite::Result<T>) -> Result<T, StoreError> {
        let mut second_chance = false;
        loop {
            {
                let mut state = self.state.lock();
                while !state.terminated && state.writing {
                    self.turn.wait(&mut state);
                }
                if state.terminated {
                    self.turn.notify_all();
                    return Err(StoreError::Terminated);
                }
                state.readers += 1;
            }

            let result = op();

            {
                let mut state = self.state.lock();
                state.readers -= 1;
                if state.readers == 0 {
                    // Last reader out; a writer may go.
                    self.turn.notify_all();
                }
            }

            match settle(result, &mut second_chance) {
                Settled::Done(r) => return r,
                Settled::Retry => {}
            }
        }
    }

    fn run_write<T>(&self, mut op: impl FnMut() -> rusqlite::Result<T>) -> Result<T, StoreError> {
        let mut second_chance = false;
        loop {
            {
                let mut state = self.state.lock();
                while !state.terminated && (state.writing || state.readers > 0) {
                    self.turn.wait(&mut state);
                }
                if state.terminated {
                    self.turn.notify_all();
                    return Err(StoreError::Terminated);
                }
                state.writing = true;
            }

            let result = op();

            {
                let mut state = self.state.lock();
                state.writing = false;
                self.turn.notify_all();
            }

            match settle(result, &mut second_chance) {
                Settled::Done(r) => return r,
                Settled::Retry => {}
            }
        }
    }
}

fn settle<T>(result: rusqlite::Result<T>, second_chance: &mut bool) -> Settled<T> {
    match result {
        Ok(v) => Settled::Done(Ok(v)),
        Err(rusqlite::Error::SqliteFailure(e, msg)) => match e.code {
            rusqlite::ErrorCode::ConstraintViolation => Settled::Done(Err(StoreError::Constraint)),
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                if !*second_chance =>
            {
                *second_chance = true;
                Settled::Retry
            }
            _ => Settled::Done(Err(StoreError::Fatal(rusqlite::Error::SqliteFailure(
                e, msg,
            )))),
        },
        Err(e) => Settled::Done(Err(StoreError::Fatal(e))),
    }
}
