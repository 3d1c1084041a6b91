//! Worker routine.
//!
//! Each worker pops jobs, checks the per-user critical zone, runs the
//! operation against the store and replies. The reply convention is a full
//! message on success and a header-only acknowledgement on failure; every
//! error acknowledgement bumps the error counter.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use log::debug;
use log::error;
use log::info;
use log::warn;
use smallvec::SmallVec;

use crate::conn::ConnTable;
use crate::ll::abi;
use crate::ll::abi::Op;
use crate::ll::codec;
use crate::queue::Body;
use crate::queue::Job;
use crate::queue::JobQueue;
use crate::queue::Message;
use crate::server::Shutdown;
use crate::slots::Phase;
use crate::slots::PhaseSlots;
use crate::slots::VOID_FD;
use crate::slots::WriteSlots;
use crate::store::BlobDir;
use crate::store::Connected;
use crate::store::Registration;
use crate::store::Repo;
use crate::store::StoreError;
use crate::store::Tally;

/// Sender name stamped on acknowledgements.
const SERVER_NAME: &str = "server";

pub(crate) struct Worker {
    pub(crate) id: usize,
    pub(crate) queue: Arc<JobQueue>,
    pub(crate) conns: Arc<ConnTable>,
    pub(crate) write_slots: Arc<WriteSlots>,
    pub(crate) phases: Arc<PhaseSlots>,
    pub(crate) repo: Repo,
    pub(crate) blobs: BlobDir,
    pub(crate) max_history: usize,
    pub(crate) shutdown: Shutdown,
}

/// Which critical-zone phase an operation runs under, if any. Protocol
/// error echoes carry no user state and skip the zone.
fn phase_of(op: Op) -> Option<Phase> {
    match op {
        Op::Register => Some(Phase::Signup),
        Op::Disconnect | Op::Unregister => Some(Phase::Ending),
        Op::Fail | Op::MsgTooLong => None,
        _ => Some(Phase::Generic),
    }
}

impl Worker {
    pub(crate) fn run(self) {
        debug!("worker {} started", self.id);
        while let Some(job) = self.queue.pop() {
            match self.handle(job) {
                Ok(()) => {}
                Err(StoreError::Terminated) => {}
                Err(err) => {
                    error!("worker {}: {err}", self.id);
                    self.shutdown.trigger();
                    break;
                }
            }
        }
        debug!("worker {} exiting", self.id);
    }

    fn handle(&self, job: Job) -> Result<(), StoreError> {
        let phase = phase_of(job.msg.op);
        if let Some(phase) = phase {
            if !self.phases.try_claim(job.fd, phase, self.id) {
                // Another worker is in an incompatible phase on this
                // descriptor; retry at the tail instead of parking.
                self.queue.push(job);
                return Ok(());
            }
        }
        let result = self.dispatch(&job);
        if phase.is_some() {
            self.phases.clear(self.id);
        }
        result
    }

    fn dispatch(&self, job: &Job) -> Result<(), StoreError> {
        let fd = job.fd;
        let msg = &job.msg;
        match msg.op {
            Op::Register => self.register(fd, msg),
            Op::Connect => self.connect(fd, msg),
            Op::UsrList => self.reply_user_list(fd, &msg.sender),
            Op::Disconnect => self.disconnect(fd),
            Op::Unregister => self.unregister(fd, msg),
            Op::PostTxt | Op::PostFile => self.post(fd, msg),
            Op::PostTxtAll => self.post_all(fd, msg),
            Op::GetFile => self.get_file(fd, msg),
            Op::GetPrevMsgs => self.history(fd, msg),
            Op::CreateGroup => self.create_group(fd, msg),
            Op::AddGroup => self.add_to_group(fd, msg),
            Op::DelGroup => self.leave_group(fd, msg),
            Op::UnregisterGroup => self.delete_group(fd, msg),
            Op::Fail | Op::MsgTooLong => self.send_ack(fd, msg.op),
            other => {
                warn!("worker {}: no handler for {other:?}", self.id);
                self.send_ack(fd, Op::Fail)
            }
        }
    }

    // ---- replies ---------------------------------------------------------

    /// Writes a full frame to `fd` under the write serializer. Returns
    /// whether the write went through; a missing or broken connection is a
    /// failed delivery, not an error.
    fn send_message(
        &self,
        fd: RawFd,
        op: Op,
        sender: &str,
        receiver: &str,
        payload: &[u8],
    ) -> bool {
        let Some(stream) = self.conns.get(fd) else {
            return false;
        };
        let _claim = self.write_slots.lock(fd, self.id);
        let mut w = &*stream;
        match codec::write_message(&mut w, op.into(), sender, receiver, payload) {
            Ok(()) => true,
            Err(err) => {
                debug!("write to fd {fd} failed: {err}");
                false
            }
        }
    }

    /// Writes a header-only acknowledgement. Anything but [`Op::Ok`]
    /// counts as an error in the statistics.
    fn send_ack(&self, fd: RawFd, op: Op) -> Result<(), StoreError> {
        if let Some(stream) = self.conns.get(fd) {
            let _claim = self.write_slots.lock(fd, self.id);
            let mut w = &*stream;
            if let Err(err) = codec::write_ack(&mut w, op.into(), SERVER_NAME) {
                debug!("ack to fd {fd} failed: {err}");
            }
        }
        if op != Op::Ok {
            self.repo.bump_stats(&Tally {
                errors: 1,
                ..Tally::default()
            })?;
        }
        Ok(())
    }

    /// Success reply carrying the online user list, one NUL-padded name
    /// slot per user.
    fn reply_user_list(&self, fd: RawFd, receiver: &str) -> Result<(), StoreError> {
        let names = self.repo.online_usernames()?;
        let mut payload = Vec::with_capacity(names.len() * abi::NAME_FIELD);
        for name in &names {
            payload.extend_from_slice(&abi::name_field(name));
        }
        self.send_message(fd, Op::Ok, "", receiver, &payload);
        Ok(())
    }

    // ---- session ---------------------------------------------------------

    fn register(&self, fd: RawFd, msg: &Message) -> Result<(), StoreError> {
        match self.repo.insert_user(&msg.sender, fd)? {
            Registration::Ok => {
                info!("registered {:?} on fd {fd}", msg.sender);
                self.reply_user_list(fd, &msg.sender)
            }
            Registration::NameTaken => self.send_ack(fd, Op::NickAlready),
            Registration::Invalid => self.send_ack(fd, Op::Fail),
        }
    }

    fn connect(&self, fd: RawFd, msg: &Message) -> Result<(), StoreError> {
        match self.repo.connect_user(&msg.sender, fd)? {
            Connected::Ok => {
                info!("{:?} connected on fd {fd}", msg.sender);
                self.reply_user_list(fd, &msg.sender)
            }
            Connected::Unknown => self.send_ack(fd, Op::NickUnknown),
            Connected::Busy => self.send_ack(fd, Op::Fail),
        }
    }

    fn disconnect(&self, fd: RawFd) -> Result<(), StoreError> {
        self.repo.disconnect_fd(fd)?;
        // Dropping the table entry is what eventually closes the
        // descriptor; by now no other worker can be using it.
        if self.conns.remove(fd) {
            info!("fd {fd} disconnected");
        }
        Ok(())
    }

    fn unregister(&self, fd: RawFd, msg: &Message) -> Result<(), StoreError> {
        let removed = self.repo.remove_user(&msg.sender)?;
        if removed {
            info!("unregistered {:?}", msg.sender);
        }
        self.send_ack(fd, if removed { Op::Ok } else { Op::Fail })
    }

    // ---- posting ---------------------------------------------------------

    /// Text or file to a single user or a group.
    fn post(&self, fd: RawFd, msg: &Message) -> Result<(), StoreError> {
        if msg.sender == msg.receiver {
            return self.send_ack(fd, Op::Fail);
        }

        let mut targets: SmallVec<[RawFd; 8]> = SmallVec::new();
        let chat_id;
        if let Some(peer_fd) = self.repo.user_fd(&msg.receiver)? {
            chat_id = self.repo.ensure_peer_chat(&msg.sender, &msg.receiver)?;
            targets.push(peer_fd);
        } else if let Some(group_id) = self.repo.group_id(&msg.receiver)? {
            if !self.repo.is_member(group_id, &msg.sender)? {
                return self.send_ack(fd, Op::NickUnknown);
            }
            chat_id = group_id;
            targets.extend(self.repo.online_fds_in_chat(group_id)?);
        } else {
            return self.send_ack(fd, Op::Fail);
        }

        // Store first: no recipient may observe a message the store does
        // not have yet.
        let payload = match &msg.body {
            Body::Text(text) => {
                self.repo.insert_text(&msg.sender, text, chat_id)?;
                c_string(text)
            }
            Body::File { name, bytes } => {
                let id = self.repo.insert_file(&msg.sender, name, chat_id)?;
                if let Err(err) = self.blobs.write(id, bytes) {
                    warn!("failed to store blob {id}: {err}");
                    return self.send_ack(fd, Op::NoSuchFile);
                }
                c_string(name)
            }
            Body::Empty => {
                self.repo.insert_text(&msg.sender, "", chat_id)?;
                c_string("")
            }
        };

        let deliver_op = if msg.op == Op::PostFile {
            Op::FileMessage
        } else {
            Op::TxtMessage
        };
        self.deliver(fd, deliver_op, &msg.sender, &msg.receiver, &payload, &targets)?;
        self.send_ack(fd, Op::Ok)
    }

    /// Text broadcast: lands in the peer chat of every other registered
    /// user, online or not.
    fn post_all(&self, fd: RawFd, msg: &Message) -> Result<(), StoreError> {
        let text = match &msg.body {
            Body::Text(text) => text.as_str(),
            _ => "",
        };
        for user in self.repo.all_usernames()? {
            if user == msg.sender {
                continue;
            }
            let chat_id = self.repo.ensure_peer_chat(&msg.sender, &user)?;
            self.repo.insert_text(&msg.sender, text, chat_id)?;
        }
        let targets = self.repo.online_fds()?;
        self.deliver(
            fd,
            Op::TxtMessage,
            &msg.sender,
            &msg.receiver,
            &c_string(text),
            &targets,
        )?;
        self.send_ack(fd, Op::Ok)
    }

    /// Fans a delivery out to `targets`, skipping the sender itself, and
    /// accounts every outcome.
    fn deliver(
        &self,
        sender_fd: RawFd,
        op: Op,
        sender: &str,
        receiver: &str,
        payload: &[u8],
        targets: &[RawFd],
    ) -> Result<(), StoreError> {
        let mut tally = Tally::default();
        {
            let (delivered, undelivered) = if op == Op::FileMessage {
                (&mut tally.delivered_file, &mut tally.not_delivered_file)
            } else {
                (&mut tally.delivered_txt, &mut tally.not_delivered_txt)
            };
            for &target in targets {
                if target == sender_fd {
                    continue;
                }
                if target == VOID_FD {
                    *undelivered += 1;
                } else if self.send_message(target, op, sender, receiver, payload) {
                    *delivered += 1;
                } else {
                    *undelivered += 1;
                }
            }
        }
        self.repo.bump_stats(&tally)
    }

    // ---- retrieval -------------------------------------------------------

    fn get_file(&self, fd: RawFd, msg: &Message) -> Result<(), StoreError> {
        let Body::Text(name) = &msg.body else {
            return self.send_ack(fd, Op::NoSuchFile);
        };
        match self.repo.file_message_id(&msg.sender, name)? {
            None => self.send_ack(fd, Op::NoSuchFile),
            Some(id) => match self.blobs.read(id) {
                Ok(bytes) => {
                    self.send_message(fd, Op::Ok, "", &msg.sender, &bytes);
                    Ok(())
                }
                Err(err) => {
                    warn!("blob {id} unreadable: {err}");
                    self.send_ack(fd, Op::NoSuchFile)
                }
            },
        }
    }

    fn history(&self, fd: RawFd, msg: &Message) -> Result<(), StoreError> {
        let entries = self.repo.recent_messages(&msg.sender, self.max_history)?;
        let Some(stream) = self.conns.get(fd) else {
            return Ok(());
        };
        // Count frame and records go out under one claim so the burst
        // stays contiguous on the stream.
        let _claim = self.write_slots.lock(fd, self.id);
        let mut w = &*stream;
        let count = (entries.len() as u64).to_le_bytes();
        if codec::write_message(&mut w, Op::Ok.into(), "", &msg.sender, &count).is_err() {
            return Ok(());
        }
        for entry in &entries {
            let payload = c_string(&entry.body);
            if codec::write_message(&mut w, entry.op.into(), &entry.sender, &msg.sender, &payload)
                .is_err()
            {
                break;
            }
        }
        Ok(())
    }

    // ---- groups ----------------------------------------------------------

    fn create_group(&self, fd: RawFd, msg: &Message) -> Result<(), StoreError> {
        match self.repo.create_group(&msg.receiver, &msg.sender)? {
            Some(_) => {
                info!("group {:?} created by {:?}", msg.receiver, msg.sender);
                self.send_ack(fd, Op::Ok)
            }
            None => self.send_ack(fd, Op::NickAlready),
        }
    }

    fn add_to_group(&self, fd: RawFd, msg: &Message) -> Result<(), StoreError> {
        let Some(group_id) = self.repo.group_id(&msg.receiver)? else {
            return self.send_ack(fd, Op::Fail);
        };
        if self.repo.insert_member(group_id, &msg.sender)? {
            self.send_ack(fd, Op::Ok)
        } else {
            self.send_ack(fd, Op::NickAlready)
        }
    }

    fn leave_group(&self, fd: RawFd, msg: &Message) -> Result<(), StoreError> {
        let Some(group_id) = self.repo.group_id(&msg.receiver)? else {
            return self.send_ack(fd, Op::NickUnknown);
        };
        if !self.repo.is_member(group_id, &msg.sender)? {
            return self.send_ack(fd, Op::NickUnknown);
        }
        self.repo.remove_from_group(group_id, &msg.sender)?;
        self.send_ack(fd, Op::Ok)
    }

    fn delete_group(&self, fd: RawFd, msg: &Message) -> Result<(), StoreError> {
        if self.repo.delete_group(&msg.sender, &msg.receiver)? {
            info!("group {:?} deleted by {:?}", msg.receiver, msg.sender);
            self.send_ack(fd, Op::Ok)
        } else {
            self.send_ack(fd, Op::Fail)
        }
    }
}

/// Text payloads travel NUL-terminated.
fn c_string(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(0);
    bytes
}
