//! Per-process message queues.
//!
//! A process opts in once with [`MessageQueue::register`]; sends to an
//! unregistered process fail. The queue owns each message buffer from the
//! moment a send succeeds until the recipient completes the message, at
//! which point the buffer is freed. At most one message per process is
//! ever checked out ("outstanding"): details must be retrieved, optionally
//! the body copied, and the message completed, in that order, before the
//! next message becomes visible.
//!
//! There is also a registry mapping human message-type names to id
//! numbers, so the name string need not travel with every message.

use crate::error::{KernelError, Result};
use crate::process::task::Pid;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;

/// One queued message. The buffer is kernel-owned.
pub struct Message {
    pub sender: Pid,
    pub id: u64,
    pub body: Vec<u8>,
}

/// The header triple handed to user space; also used as the cross-check
/// token for completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageDetails {
    pub sender: Pid,
    pub id: u64,
    pub len: u64,
}

impl Message {
    fn details(&self) -> MessageDetails {
        MessageDetails {
            sender: self.sender,
            id: self.id,
            len: self.body.len() as u64,
        }
    }
}

struct QueueInner {
    accepts: bool,
    outstanding: bool,
    queue: VecDeque<Message>,
}

pub struct MessageQueue {
    inner: Mutex<QueueInner>,
}

impl MessageQueue {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                accepts: false,
                outstanding: false,
                queue: VecDeque::new(),
            }),
        }
    }

    /// One-shot opt-in. Registering twice is an error; processes that do
    /// not want messages simply never call this.
    pub fn register(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.accepts {
            return Err(KernelError::InvalidOp);
        }
        inner.accepts = true;
        inner.outstanding = false;
        inner.queue.clear();
        Ok(())
    }

    pub fn accepts_messages(&self) -> bool {
        self.inner.lock().accepts
    }

    /// Append a message. On success the queue owns `message.body`.
    pub fn send(&self, message: Message) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.accepts {
            return Err(KernelError::SyncMsgNotAccepted);
        }
        inner.queue.push_back(message);
        Ok(())
    }

    /// Check out the next message and return its header. The message stays
    /// at the head of the queue until completed, and no further message
    /// can be checked out before then.
    pub fn retrieve_next(&self) -> Result<MessageDetails> {
        let mut inner = self.inner.lock();
        if !inner.accepts {
            return Err(KernelError::SyncMsgNotAccepted);
        }
        if inner.outstanding {
            return Err(KernelError::SyncMsgIncomplete);
        }
        match inner.queue.front() {
            None => Err(KernelError::SyncMsgQueueEmpty),
            Some(msg) => {
                let details = msg.details();
                inner.outstanding = true;
                Ok(details)
            }
        }
    }

    /// Run `f` over the checked-out message (to re-read its header or copy
    /// its body). Fails if no message is checked out.
    pub fn with_current<R>(&self, f: impl FnOnce(&Message) -> R) -> Result<R> {
        let inner = self.inner.lock();
        if !inner.accepts {
            return Err(KernelError::SyncMsgNotAccepted);
        }
        if !inner.outstanding {
            return Err(KernelError::SyncMsgMismatch);
        }
        Ok(f(inner.queue.front().expect("outstanding implies a head")))
    }

    /// Finish with the checked-out message, freeing its buffer. `header`
    /// must match the message being completed — the cross-check catches
    /// recipients that complete twice or mangle their bookkeeping.
    pub fn complete(&self, header: MessageDetails) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.accepts {
            return Err(KernelError::SyncMsgNotAccepted);
        }
        if !inner.outstanding {
            return Err(KernelError::SyncMsgMismatch);
        }
        let front = inner.queue.front().expect("outstanding implies a head");
        if front.details() != header {
            return Err(KernelError::SyncMsgMismatch);
        }
        inner.queue.pop_front();
        inner.outstanding = false;
        Ok(())
    }

    pub fn queued_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Drop everything; used when the owning process dies.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.accepts = false;
        inner.outstanding = false;
        inner.queue.clear();
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Message-type registry: name <-> id, both unique.
// ---------------------------------------------------------------------------

struct MsgTypeRegistry {
    name_to_id: BTreeMap<String, u64>,
    id_to_name: BTreeMap<u64, String>,
}

static MSG_TYPES: Mutex<MsgTypeRegistry> = Mutex::new(MsgTypeRegistry {
    name_to_id: BTreeMap::new(),
    id_to_name: BTreeMap::new(),
});

/// Register a message type. Both the name and the id must be unused.
pub fn register_msg_id(name: &str, id: u64) -> Result<()> {
    let mut reg = MSG_TYPES.lock();
    if reg.name_to_id.contains_key(name) || reg.id_to_name.contains_key(&id) {
        return Err(KernelError::AlreadyExists);
    }
    reg.name_to_id.insert(String::from(name), id);
    reg.id_to_name.insert(id, String::from(name));
    Ok(())
}

pub fn msg_id_for_name(name: &str) -> Result<u64> {
    MSG_TYPES
        .lock()
        .name_to_id
        .get(name)
        .copied()
        .ok_or(KernelError::NotFound)
}

pub fn msg_name_for_id(id: u64) -> Result<String> {
    MSG_TYPES
        .lock()
        .id_to_name
        .get(&id)
        .cloned()
        .ok_or(KernelError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(sender: Pid, id: u64, body: &[u8]) -> Message {
        Message {
            sender,
            id,
            body: body.to_vec(),
        }
    }

    #[test]
    fn full_message_lifecycle() {
        let q = MessageQueue::new();
        q.register().unwrap();
        q.send(msg(9, 7, b"hi")).unwrap();

        let details = q.retrieve_next().unwrap();
        assert_eq!(
            details,
            MessageDetails {
                sender: 9,
                id: 7,
                len: 2
            }
        );
        let body = q.with_current(|m| m.body.clone()).unwrap();
        assert_eq!(body, b"hi");
        q.complete(details).unwrap();
        assert_eq!(q.retrieve_next().unwrap_err(), KernelError::SyncMsgQueueEmpty);
    }

    #[test]
    fn send_to_unregistered_process_fails() {
        let q = MessageQueue::new();
        assert_eq!(
            q.send(msg(1, 1, b"x")).unwrap_err(),
            KernelError::SyncMsgNotAccepted
        );
    }

    #[test]
    fn double_registration_fails() {
        let q = MessageQueue::new();
        q.register().unwrap();
        assert_eq!(q.register().unwrap_err(), KernelError::InvalidOp);
    }

    #[test]
    fn only_one_message_in_flight() {
        let q = MessageQueue::new();
        q.register().unwrap();
        q.send(msg(1, 1, b"a")).unwrap();
        q.send(msg(1, 2, b"b")).unwrap();

        let first = q.retrieve_next().unwrap();
        assert_eq!(
            q.retrieve_next().unwrap_err(),
            KernelError::SyncMsgIncomplete
        );
        q.complete(first).unwrap();
        let second = q.retrieve_next().unwrap();
        assert_eq!(second.id, 2);
        q.complete(second).unwrap();
    }

    #[test]
    fn completion_cross_checks_the_header() {
        let q = MessageQueue::new();
        q.register().unwrap();
        q.send(msg(1, 1, b"abc")).unwrap();
        let details = q.retrieve_next().unwrap();

        let bogus = MessageDetails {
            id: 99,
            ..details
        };
        assert_eq!(q.complete(bogus).unwrap_err(), KernelError::SyncMsgMismatch);
        q.complete(details).unwrap();
        // Completing again is a mismatch, not a double free.
        assert_eq!(q.complete(details).unwrap_err(), KernelError::SyncMsgMismatch);
    }

    #[test]
    fn body_access_requires_checkout() {
        let q = MessageQueue::new();
        q.register().unwrap();
        q.send(msg(1, 1, b"x")).unwrap();
        assert_eq!(
            q.with_current(|m| m.body.len()).unwrap_err(),
            KernelError::SyncMsgMismatch
        );
    }

    #[test]
    fn type_registry_rejects_duplicates() {
        register_msg_id("msgtest.alpha", 9001).unwrap();
        assert_eq!(
            register_msg_id("msgtest.alpha", 9002).unwrap_err(),
            KernelError::AlreadyExists
        );
        assert_eq!(
            register_msg_id("msgtest.beta", 9001).unwrap_err(),
            KernelError::AlreadyExists
        );
        assert_eq!(msg_id_for_name("msgtest.alpha").unwrap(), 9001);
        assert_eq!(msg_name_for_id(9001).unwrap(), "msgtest.alpha");
        assert_eq!(
            msg_id_for_name("msgtest.missing").unwrap_err(),
            KernelError::NotFound
        );
    }
}
