//! System V-style message queues: bounded queues of typed byte
//! messages, looked up by key.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{IpcError, KernelError, KernelResult};

/// Queues available system-wide.
pub const MAX_MSG_QUEUES: usize = 8;

/// Messages one queue holds at most.
pub const MAX_QUEUE_DEPTH: usize = 32;

/// Largest message body accepted.
pub const MAX_MSG_SIZE: usize = 512;

struct Message {
    mtype: u32,
    body: Vec<u8>,
}

struct MsgQueue {
    in_use: bool,
    key: u32,
    messages: VecDeque<Message>,
}

impl MsgQueue {
    const fn empty() -> Self {
        Self {
            in_use: false,
            key: 0,
            messages: VecDeque::new(),
        }
    }
}

static QUEUES: Mutex<[MsgQueue; MAX_MSG_QUEUES]> =
    Mutex::new([const { MsgQueue::empty() }; MAX_MSG_QUEUES]);

/// `msgget`: find or create the queue with `key`.
pub fn msgget(key: u32) -> KernelResult<usize> {
    let mut queues = QUEUES.lock();
    if let Some(id) = queues.iter().position(|q| q.in_use && q.key == key) {
        return Ok(id);
    }
    let id = queues
        .iter()
        .position(|q| !q.in_use)
        .ok_or(IpcError::TableFull)?;
    queues[id] = MsgQueue {
        in_use: true,
        key,
        messages: VecDeque::new(),
    };
    Ok(id)
}

/// `msgsnd`: append a message. A full queue asks the caller to retry.
pub fn msgsnd(id: usize, mtype: u32, body: &[u8]) -> KernelResult<()> {
    if body.len() > MAX_MSG_SIZE {
        return Err(IpcError::MessageTooBig.into());
    }
    let mut queues = QUEUES.lock();
    let queue = queues
        .get_mut(id)
        .filter(|q| q.in_use)
        .ok_or(IpcError::NotFound)?;
    if queue.messages.len() >= MAX_QUEUE_DEPTH {
        return Err(KernelError::TryAgain);
    }
    queue.messages.push_back(Message {
        mtype,
        body: body.to_vec(),
    });
    Ok(())
}

/// `msgrcv`: take the oldest message, or the oldest of type `mtype` when
/// it is non-zero. An empty pick asks the caller to retry.
pub fn msgrcv(id: usize, mtype: u32, buf: &mut [u8]) -> KernelResult<(u32, usize)> {
    let mut queues = QUEUES.lock();
    let queue = queues
        .get_mut(id)
        .filter(|q| q.in_use)
        .ok_or(IpcError::NotFound)?;

    let position = queue
        .messages
        .iter()
        .position(|m| mtype == 0 || m.mtype == mtype)
        .ok_or(KernelError::WouldBlock)?;
    let message = queue
        .messages
        .remove(position)
        .expect("position from the same locked queue");

    let count = buf.len().min(message.body.len());
    buf[..count].copy_from_slice(&message.body[..count]);
    Ok((message.mtype, count))
}

/// Destroy a queue and everything still in it.
pub fn msg_remove(id: usize) -> KernelResult<()> {
    let mut queues = QUEUES.lock();
    let queue = queues
        .get_mut(id)
        .filter(|q| q.in_use)
        .ok_or(IpcError::NotFound)?;
    *queue = MsgQueue::empty();
    Ok(())
}

pub fn depth(id: usize) -> KernelResult<usize> {
    let queues = QUEUES.lock();
    queues
        .get(id)
        .filter(|q| q.in_use)
        .map(|q| q.messages.len())
        .ok_or(IpcError::NotFound.into())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn send_receive_in_order_with_type_filter() {
        let id = msgget(0x1111).expect("queue");
        msgsnd(id, 1, b"first").expect("send");
        msgsnd(id, 2, b"second").expect("send");
        msgsnd(id, 1, b"third").expect("send");

        let mut buf = [0u8; 64];
        // Type filter pulls the oldest type-2 message past older ones.
        let (mtype, len) = msgrcv(id, 2, &mut buf).expect("typed receive");
        assert_eq!(mtype, 2);
        assert_eq!(&buf[..len], b"second");

        // Untyped receive is strict FIFO over what remains.
        let (mtype, len) = msgrcv(id, 0, &mut buf).expect("receive");
        assert_eq!((mtype, &buf[..len]), (1, &b"first"[..]));
        let (_, len) = msgrcv(id, 0, &mut buf).expect("receive");
        assert_eq!(&buf[..len], b"third");

        assert_eq!(msgrcv(id, 0, &mut buf), Err(KernelError::WouldBlock));
        msg_remove(id).expect("cleanup");
    }

    #[test]
    fn keys_name_queues() {
        let a = msgget(0x2222).expect("queue");
        let b = msgget(0x2222).expect("same queue");
        assert_eq!(a, b);
        msg_remove(a).expect("cleanup");
    }

    #[test]
    fn bounded_depth_and_size() {
        let id = msgget(0x3333).expect("queue");
        for i in 0..MAX_QUEUE_DEPTH {
            msgsnd(id, 1, &[i as u8]).expect("fill");
        }
        assert_eq!(msgsnd(id, 1, b"x"), Err(KernelError::TryAgain));

        let big = [0u8; MAX_MSG_SIZE + 1];
        assert_eq!(
            msgsnd(id, 1, &big),
            Err(KernelError::Ipc(IpcError::MessageTooBig))
        );
        msg_remove(id).expect("cleanup");
    }

    #[test]
    fn unknown_queue_is_reported() {
        let mut buf = [0u8; 4];
        assert!(msgsnd(99, 1, b"x").is_err());
        assert!(msgrcv(99, 0, &mut buf).is_err());
    }
}
