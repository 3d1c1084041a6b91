//! Server lifecycle.
//!
//! [`Server::new`] prepares everything the run needs: the store (schema on
//! first use, forced disconnects otherwise), the blob directory, the
//! listening socket and the shared tables. [`Server::run`] spawns the
//! worker pool, drives the dispatcher on the calling thread and tears the
//! whole thing down once the shutdown event fires.

use std::fmt;
use std::fs;
use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use log::debug;
use log::info;
use log::warn;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;
use nix::sys::socket::AddressFamily;
use nix::sys::socket::Backlog;
use nix::sys::socket::SockFlag;
use nix::sys::socket::SockType;
use nix::sys::socket::UnixAddr;
use nix::sys::socket::bind;
use nix::sys::socket::listen;
use nix::sys::socket::socket;

use crate::conn::ConnTable;
use crate::dispatcher::Dispatcher;
use crate::queue::JobQueue;
use crate::slots::PhaseSlots;
use crate::slots::WriteSlots;
use crate::stats::Stats;
use crate::store::BlobDir;
use crate::store::Repo;
use crate::store::Store;
use crate::worker::Worker;

/// Hard cap on the worker pool size.
pub const MAX_WORKERS: usize = 64;

/// Server configuration.
///
/// Build one with the setter methods and hand it to [`Server::new`], which
/// validates it.
#[derive(Debug, Clone)]
pub struct Config {
    /// Filesystem path of the listening socket.
    pub socket_path: PathBuf,
    /// Path of the SQLite store file.
    pub db_path: PathBuf,
    /// Directory holding posted file blobs.
    pub blob_dir: PathBuf,
    /// File that [`StatsReporter::append`] writes to.
    pub stats_path: PathBuf,
    /// Bias for the listen backlog.
    pub max_connections: usize,
    /// Worker pool size, at most [`MAX_WORKERS`].
    pub workers: usize,
    /// Per-text-message payload ceiling in bytes.
    pub max_msg_size: usize,
    /// Per-file payload ceiling in KiB.
    pub max_file_size: usize,
    /// Most messages a history request returns.
    pub max_history: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket_path: PathBuf::from("/tmp/chatty_socket"),
            db_path: PathBuf::from("/tmp/chatty.db"),
            blob_dir: PathBuf::from("/tmp/chatty"),
            stats_path: PathBuf::from("/tmp/chatty_stats.txt"),
            max_connections: 64,
            workers: 4,
            max_msg_size: 512,
            max_file_size: 4096,
            max_history: 32,
        }
    }
}

impl Config {
    /// A configuration with the default values.
    pub fn new() -> Config {
        Config::default()
    }

    /// Sets the listening socket path.
    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Config {
        self.socket_path = path.into();
        self
    }

    /// Sets the store file path.
    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Config {
        self.db_path = path.into();
        self
    }

    /// Sets the blob directory.
    pub fn blob_dir(mut self, path: impl Into<PathBuf>) -> Config {
        self.blob_dir = path.into();
        self
    }

    /// Sets the statistics file path.
    pub fn stats_path(mut self, path: impl Into<PathBuf>) -> Config {
        self.stats_path = path.into();
        self
    }

    /// Sets the listen backlog bias.
    pub fn max_connections(mut self, n: usize) -> Config {
        self.max_connections = n;
        self
    }

    /// Sets the worker pool size.
    pub fn workers(mut self, n: usize) -> Config {
        self.workers = n;
        self
    }

    /// Sets the text payload ceiling in bytes.
    pub fn max_msg_size(mut self, bytes: usize) -> Config {
        self.max_msg_size = bytes;
        self
    }

    /// Sets the file payload ceiling in KiB.
    pub fn max_file_size(mut self, kib: usize) -> Config {
        self.max_file_size = kib;
        self
    }

    /// Sets the history cap.
    pub fn max_history(mut self, n: usize) -> Config {
        self.max_history = n;
        self
    }

    /// Checks the configuration for values the server cannot run with.
    pub fn validate(&self) -> io::Result<()> {
        if self.workers == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "workers must be at least 1",
            ));
        }
        if self.workers > MAX_WORKERS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("workers cannot exceed {MAX_WORKERS}"),
            ));
        }
        if self.max_msg_size == 0 || self.max_file_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "message and file size limits must be positive",
            ));
        }
        Ok(())
    }
}

/// Handle that asks a running server to stop.
///
/// Clonable and usable from any thread; an external signal handler would
/// hold one.
#[derive(Clone)]
pub struct Shutdown {
    event: Arc<EventFd>,
}

impl Shutdown {
    /// Fires the shutdown event. Idempotent.
    pub fn trigger(&self) {
        if let Err(err) = self.event.write(1) {
            warn!("failed to signal shutdown: {err}");
        }
    }
}

impl fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shutdown").finish_non_exhaustive()
    }
}

/// Reads the server counters on demand, over its own store connection.
pub struct StatsReporter {
    repo: Repo,
    stats_path: PathBuf,
}

impl StatsReporter {
    /// Current counter snapshot.
    pub fn snapshot(&self) -> io::Result<Stats> {
        self.repo.stats().map_err(io::Error::other)
    }

    /// Appends the current snapshot to the configured statistics file.
    pub fn append(&self) -> io::Result<()> {
        self.snapshot()?.append_to(&self.stats_path)
    }
}

impl fmt::Debug for StatsReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsReporter")
            .field("stats_path", &self.stats_path)
            .finish_non_exhaustive()
    }
}

/// A chat server, bound and ready to run.
pub struct Server {
    config: Config,
    store: Store,
    blobs: BlobDir,
    listener: UnixListener,
    shutdown_event: Arc<EventFd>,
    queue: Arc<JobQueue>,
    conns: Arc<ConnTable>,
    write_slots: Arc<WriteSlots>,
    phases: Arc<PhaseSlots>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Validates the configuration, prepares the store and blob directory
    /// and binds the listening socket.
    pub fn new(config: Config) -> io::Result<Server> {
        config.validate()?;

        let store = Store::open(&config.db_path);
        store.init().map_err(io::Error::other)?;
        let blobs = BlobDir::create(&config.blob_dir)?;
        let listener = bind_listener(&config.socket_path, config.max_connections + 2)?;
        let shutdown_event = Arc::new(
            EventFd::from_value_and_flags(0, EfdFlags::empty()).map_err(io::Error::from)?,
        );

        info!("listening on {}", config.socket_path.display());

        let workers = config.workers;
        Ok(Server {
            config,
            store,
            blobs,
            listener,
            shutdown_event,
            queue: Arc::new(JobQueue::new()),
            conns: Arc::new(ConnTable::new()),
            write_slots: Arc::new(WriteSlots::new(workers)),
            phases: Arc::new(PhaseSlots::new(workers)),
        })
    }

    /// A handle that stops this server when triggered.
    pub fn shutdown_handle(&self) -> Shutdown {
        Shutdown {
            event: Arc::clone(&self.shutdown_event),
        }
    }

    /// A statistics reader over its own store connection.
    pub fn stats_reporter(&self) -> io::Result<StatsReporter> {
        Ok(StatsReporter {
            repo: self.store.connect().map_err(io::Error::other)?,
            stats_path: self.config.stats_path.clone(),
        })
    }

    /// Runs the server on the calling thread until the shutdown event
    /// fires, then joins the workers and releases everything.
    pub fn run(self) -> io::Result<()> {
        let Server {
            config,
            store,
            blobs,
            listener,
            shutdown_event,
            queue,
            conns,
            write_slots,
            phases,
        } = self;
        let shutdown = Shutdown {
            event: Arc::clone(&shutdown_event),
        };

        let mut workers: Vec<JoinHandle<()>> = Vec::with_capacity(config.workers);
        let mut spawn_error = None;
        for id in 0..config.workers {
            let spawned = store
                .connect()
                .map_err(io::Error::other)
                .and_then(|repo| {
                    let worker = Worker {
                        id,
                        queue: Arc::clone(&queue),
                        conns: Arc::clone(&conns),
                        write_slots: Arc::clone(&write_slots),
                        phases: Arc::clone(&phases),
                        repo,
                        blobs: blobs.clone(),
                        max_history: config.max_history,
                        shutdown: shutdown.clone(),
                    };
                    thread::Builder::new()
                        .name(format!("chatd-worker-{id}"))
                        .spawn(move || worker.run())
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    spawn_error = Some(err);
                    break;
                }
            }
        }

        let result = match spawn_error {
            Some(err) => Err(err),
            None => Dispatcher::new(
                listener,
                Arc::clone(&shutdown_event),
                Arc::clone(&conns),
                Arc::clone(&queue),
                config.max_msg_size,
                config.max_file_size,
            )
            .run(),
        };

        // Stop order: wake everything that may be parked, then join.
        queue.terminate();
        store.terminate();
        write_slots.wake_all();
        for handle in workers {
            if handle.join().is_err() {
                warn!("a worker panicked during shutdown");
            }
        }
        conns.clear();
        if let Err(err) = fs::remove_file(&config.socket_path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("could not unlink {}: {err}", config.socket_path.display());
            }
        }
        info!("server stopped");
        result
    }

    /// Runs the server on a background thread.
    pub fn spawn(self) -> io::Result<BackgroundServer> {
        let shutdown = self.shutdown_handle();
        let reporter = self.stats_reporter()?;
        let guard = thread::Builder::new()
            .name("chatd-dispatch".to_owned())
            .spawn(move || self.run())?;
        Ok(BackgroundServer {
            shutdown,
            reporter,
            guard: Some(guard),
        })
    }
}

/// A server running on a background thread. Dropping it shuts the server
/// down and waits for it.
pub struct BackgroundServer {
    shutdown: Shutdown,
    reporter: StatsReporter,
    guard: Option<JoinHandle<io::Result<()>>>,
}

impl BackgroundServer {
    /// A handle that stops this server when triggered.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Current counter snapshot.
    pub fn stats(&self) -> io::Result<Stats> {
        self.reporter.snapshot()
    }

    /// The statistics reader attached to this server.
    pub fn stats_reporter(&self) -> &StatsReporter {
        &self.reporter
    }

    /// Stops the server and waits for it to finish.
    pub fn join(mut self) -> io::Result<()> {
        self.shutdown.trigger();
        match self.guard.take() {
            Some(guard) => guard
                .join()
                .map_err(|_| io::Error::other("server thread panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for BackgroundServer {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            self.shutdown.trigger();
            if guard.join().is_err() {
                warn!("server thread panicked");
            }
        }
    }
}

impl fmt::Debug for BackgroundServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundServer").finish_non_exhaustive()
    }
}

/// Binds the listening socket, unlinking any stale node first.
fn bind_listener(path: &Path, backlog: usize) -> io::Result<UnixListener> {
    match fs::remove_file(path) {
        Ok(()) => debug!("removed stale socket {}", path.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    let sock = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .map_err(io::Error::from)?;
    let addr = UnixAddr::new(path).map_err(io::Error::from)?;
    bind(sock.as_raw_fd(), &addr).map_err(io::Error::from)?;
    let backlog = Backlog::new(backlog as i32).unwrap_or(Backlog::MAXCONN);
    listen(&sock, backlog).map_err(io::Error::from)?;
    Ok(UnixListener::from(sock))
}
