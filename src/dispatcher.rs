//! Acceptor and frame dispatcher.
//!
//! A single thread multiplexes the listening socket, the shutdown event
//! descriptor and every client connection with `select(2)`. Each readable
//! client yields one frame, which is validated, typed and pushed onto the
//! work queue; transport errors become synthesized disconnects so the
//! workers always see a consistent stream of jobs.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::AsFd;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixListener;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;

use log::debug;
use log::info;
use log::warn;
use nix::errno::Errno;
use nix::sys::eventfd::EventFd;
use nix::sys::select::FdSet;
use nix::sys::select::select;

use crate::conn::ConnTable;
use crate::ll::abi::Op;
use crate::ll::codec;
use crate::ll::codec::RawMessage;
use crate::queue::Body;
use crate::queue::Job;
use crate::queue::JobQueue;
use crate::queue::Message;

pub(crate) struct Dispatcher {
    listener: UnixListener,
    shutdown_event: Arc<EventFd>,
    conns: Arc<ConnTable>,
    queue: Arc<JobQueue>,
    max_msg_size: usize,
    max_file_bytes: usize,
    /// Connections this thread still polls. A worker closing a descriptor
    /// drops it from the shared table; it falls out of here on the next
    /// turn of the loop.
    active: HashMap<RawFd, Arc<UnixStream>>,
}

impl Dispatcher {
    pub(crate) fn new(
        listener: UnixListener,
        shutdown_event: Arc<EventFd>,
        conns: Arc<ConnTable>,
        queue: Arc<JobQueue>,
        max_msg_size: usize,
        max_file_kib: usize,
    ) -> Dispatcher {
        Dispatcher {
            listener,
            shutdown_event,
            conns,
            queue,
            max_msg_size,
            max_file_bytes: max_file_kib * 1024,
            active: HashMap::new(),
        }
    }

    /// Runs until the shutdown event fires or `select` fails.
    pub(crate) fn run(&mut self) -> io::Result<()> {
        loop {
            // Descriptors a worker closed since the last turn fall out of
            // the poll set here.
            let conns = &self.conns;
            self.active.retain(|fd, _| conns.contains(*fd));
            let streams: Vec<Arc<UnixStream>> = self.active.values().cloned().collect();

            let shutdown_hit;
            let accept_hit;
            let mut ready: Vec<Arc<UnixStream>> = Vec::new();
            {
                let mut readable = FdSet::new();
                readable.insert(self.listener.as_fd());
                readable.insert(self.shutdown_event.as_fd());
                for stream in &streams {
                    readable.insert(stream.as_fd());
                }

                match select(None, &mut readable, None, None, None) {
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(err) => return Err(err.into()),
                }

                shutdown_hit = readable.contains(self.shutdown_event.as_fd());
                accept_hit = readable.contains(self.listener.as_fd());
                for stream in &streams {
                    if readable.contains(stream.as_fd()) {
                        ready.push(Arc::clone(stream));
                    }
                }
            }

            if shutdown_hit {
                info!("shutdown event received");
                return Ok(());
            }

            if accept_hit {
                // A failed accept is not worth stopping the server for.
                match self.listener.accept() {
                    Ok((stream, _)) => {
                        let (fd, stream) = self.conns.insert(stream);
                        self.active.insert(fd, stream);
                        info!("client connected on fd {fd}");
                    }
                    Err(err) => warn!("accept failed: {err}"),
                }
            }

            for stream in &ready {
                self.service(stream);
            }
        }
    }

    /// Reads and enqueues one frame from a readable connection.
    fn service(&mut self, stream: &Arc<UnixStream>) {
        let fd = stream.as_raw_fd();
        let mut reader = &**stream;

        let raw = match codec::read_message(&mut reader) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.hang_up(fd);
                return;
            }
            Err(err) => {
                debug!("read on fd {fd} failed: {err}");
                self.hang_up(fd);
                return;
            }
        };

        let op = Op::try_from(raw.op).ok().filter(|op| op.is_request());

        if op == Some(Op::PostFile) {
            self.ingest_file(fd, stream, raw);
            return;
        }

        let msg = if raw.payload.len() > self.max_msg_size {
            Message::control(Op::MsgTooLong)
        } else {
            match op {
                None => Message::control(Op::Fail),
                Some(op) => typed(op, raw),
            }
        };
        self.queue.push(Job { fd, msg });
    }

    /// Second half of a file post: the first frame named the file, the
    /// paired data frame carries its bytes.
    fn ingest_file(&mut self, fd: RawFd, stream: &Arc<UnixStream>, first: RawMessage) {
        let mut reader = &**stream;
        let bytes = match codec::read_data(&mut reader) {
            Ok(Some((_, bytes))) => bytes,
            Ok(None) => {
                self.hang_up(fd);
                return;
            }
            Err(err) => {
                debug!("file read on fd {fd} failed: {err}");
                self.hang_up(fd);
                return;
            }
        };

        let msg = if bytes.len() > self.max_file_bytes {
            Message::control(Op::MsgTooLong)
        } else {
            Message {
                op: Op::PostFile,
                sender: first.sender,
                receiver: first.receiver,
                body: Body::File {
                    name: basename(&trim_nul(first.payload)),
                    bytes,
                },
            }
        };
        self.queue.push(Job { fd, msg });
    }

    /// The peer went away: stop polling the descriptor and let a worker
    /// run the disconnect.
    fn hang_up(&mut self, fd: RawFd) {
        info!("connection on fd {fd} closed");
        self.active.remove(&fd);
        self.queue.push(Job {
            fd,
            msg: Message::control(Op::Disconnect),
        });
    }
}

fn typed(op: Op, raw: RawMessage) -> Message {
    let body = match op {
        Op::PostTxt | Op::PostTxtAll | Op::GetFile => Body::Text(trim_nul(raw.payload)),
        _ => Body::Empty,
    };
    Message {
        op,
        sender: raw.sender,
        receiver: raw.receiver,
        body,
    }
}

/// Payload strings arrive NUL-terminated.
fn trim_nul(payload: Vec<u8>) -> String {
    let end = memchr::memchr(0, &payload).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

/// Clients send whatever path their file had locally; only the last
/// component names the blob.
fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_owned())
}
