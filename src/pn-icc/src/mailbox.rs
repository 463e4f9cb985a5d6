//! The ICC transport: one fixed-capacity mailbox per (sender, receiver) ordered pair, matching
//! "allocated from a shared fixed pool... freed by the receiver". Modeled on `icc_alloc`/
//! `icc_send`/`icc_free` in the original `vm.c`, with the inter-processor interrupt collapsed
//! into the receiving core blocking on its mailbox (the interrupt only exists in the original to
//! wake a core out of `hlt`; an OS thread parked on a channel gets the same effect for free).

use std::{
    collections::HashMap,
    sync::atomic::{AtomicI64, Ordering},
};

use counter::TotalCounter;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;

use crate::{
    error::IccError,
    message::{IccMessage, MAX_RETRIES},
};

pub const DEFAULT_MAILBOX_CAPACITY: usize = 32;

counter::counter! {
    ICC_SENT_TOTAL: TotalCounter = TotalCounter::new("icc.sent.total");
    ICC_FREED_TOTAL: TotalCounter = TotalCounter::new("icc.freed.total");
}

struct CoreMailbox {
    tx: Sender<IccMessage>,
    rx: Receiver<IccMessage>,
    capacity: usize,
    /// Messages sent but not yet freed by the receiver. A test that drains every message it
    /// receives and frees each one should always observe this at 0 once idle; a nonzero value
    /// after drain is a slot leak.
    outstanding: AtomicI64,
}

/// Routes [`IccMessage`]s between cores, identified by APIC id.
pub struct IccRouter {
    cores: Mutex<HashMap<u32, CoreMailbox>>,
    capacity: usize,
}

impl IccRouter {
    pub fn new(capacity: usize) -> Self {
        Self {
            cores: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Registers a core's mailbox. Must be called once per core before `send`/`recv` target it.
    pub fn register_core(&self, apic_id: u32) {
        let (tx, rx) = crossbeam_channel::bounded(self.capacity);
        self.cores.lock().insert(
            apic_id,
            CoreMailbox {
                tx,
                rx,
                capacity: self.capacity,
                outstanding: AtomicI64::new(0),
            },
        );
    }

    /// `icc_alloc` + `icc_send` combined: hands `msg` to `target`'s mailbox. Errors if the
    /// mailbox is full (the pool is exhausted) or `target` isn't registered.
    pub fn send(&self, target: u32, msg: IccMessage) -> Result<(), IccError> {
        let cores = self.cores.lock();
        let mailbox = cores.get(&target).ok_or(IccError::UnknownCore(target))?;

        mailbox
            .tx
            .try_send(msg)
            .map_err(|_| IccError::PoolExhausted {
                core: target,
                capacity: mailbox.capacity,
            })?;

        mailbox.outstanding.fetch_add(1, Ordering::SeqCst);
        ICC_SENT_TOTAL.count();
        Ok(())
    }

    /// Blocks until a message for `target` arrives.
    pub fn recv(&self, target: u32) -> Result<IccMessage, IccError> {
        let rx = {
            let cores = self.cores.lock();
            let mailbox = cores.get(&target).ok_or(IccError::UnknownCore(target))?;
            mailbox.rx.clone()
        };

        rx.recv().map_err(|_| IccError::UnknownCore(target))
    }

    /// Non-blocking receive; `Ok(None)` if the mailbox is currently empty.
    pub fn try_recv(&self, target: u32) -> Result<Option<IccMessage>, IccError> {
        let cores = self.cores.lock();
        let mailbox = cores.get(&target).ok_or(IccError::UnknownCore(target))?;

        match mailbox.rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Ok(None),
        }
    }

    /// `icc_free`: releases `msg`'s slot back to `owner`'s mailbox pool.
    pub fn free(&self, owner: u32, _msg: IccMessage) -> Result<(), IccError> {
        let cores = self.cores.lock();
        let mailbox = cores.get(&owner).ok_or(IccError::UnknownCore(owner))?;
        mailbox.outstanding.fetch_sub(1, Ordering::SeqCst);
        ICC_FREED_TOTAL.count();
        Ok(())
    }

    /// Number of messages sent to `owner`'s mailbox that have not yet been freed.
    pub fn outstanding(&self, owner: u32) -> Result<i64, IccError> {
        let cores = self.cores.lock();
        let mailbox = cores.get(&owner).ok_or(IccError::UnknownCore(owner))?;
        Ok(mailbox.outstanding.load(Ordering::SeqCst))
    }

    /// The bounded analogue of `icc_resumed`/`icc_stopped`'s `result == -1000` repost: reposts
    /// `msg` to `target` with its retry counter incremented, or fails once
    /// [`MAX_RETRIES`](crate::message::MAX_RETRIES) reposts have already happened.
    pub fn repost_or_fail(&self, target: u32, mut msg: IccMessage) -> Result<(), IccError> {
        if msg.retries >= MAX_RETRIES {
            return Err(IccError::RetryExhausted {
                core: target,
                retries: msg.retries,
            });
        }

        msg.retries += 1;
        msg.result = 0;
        self.send(target, msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::IccPayload;

    fn router() -> IccRouter {
        let router = IccRouter::new(DEFAULT_MAILBOX_CAPACITY);
        router.register_core(0);
        router.register_core(1);
        router
    }

    #[test]
    fn send_then_recv_round_trips() {
        let router = router();
        router
            .send(1, IccMessage::new(0, IccPayload::Start { vm_addr: 0x1000 }))
            .unwrap();

        let msg = router.try_recv(1).unwrap().unwrap();
        assert_eq!(msg.sender, 0);
        assert_eq!(msg.payload.ty(), crate::message::IccMessageType::Start);
    }

    #[test]
    fn send_to_unregistered_core_errors() {
        let router = router();
        assert_eq!(
            router.send(99, IccMessage::new(0, IccPayload::Stop)),
            Err(IccError::UnknownCore(99))
        );
    }

    #[test]
    fn mailbox_capacity_is_enforced() {
        let router = IccRouter::new(1);
        router.register_core(1);

        router.send(1, IccMessage::new(0, IccPayload::Pause)).unwrap();
        assert_eq!(
            router.send(1, IccMessage::new(0, IccPayload::Pause)),
            Err(IccError::PoolExhausted { core: 1, capacity: 1 })
        );
    }

    #[test]
    fn free_clears_outstanding_count() {
        let router = router();
        router.send(1, IccMessage::new(0, IccPayload::Stop)).unwrap();
        assert_eq!(router.outstanding(1).unwrap(), 1);

        let msg = router.try_recv(1).unwrap().unwrap();
        router.free(1, msg).unwrap();
        assert_eq!(router.outstanding(1).unwrap(), 0);
    }

    #[test]
    fn repost_increments_retry_count_until_exhausted() {
        let router = router();
        let mut msg = IccMessage::with_result(
            1,
            IccPayload::Resumed,
            crate::message::ICC_RETRY_LATER,
        );
        msg.retries = crate::message::MAX_RETRIES - 1;

        router.repost_or_fail(1, msg).unwrap();
        let reposted = router.try_recv(1).unwrap().unwrap();
        assert_eq!(reposted.retries, crate::message::MAX_RETRIES);
        assert_eq!(reposted.result, 0);

        assert_eq!(
            router.repost_or_fail(1, reposted),
            Err(IccError::RetryExhausted {
                core: 1,
                retries: crate::message::MAX_RETRIES
            })
        );
    }
}
