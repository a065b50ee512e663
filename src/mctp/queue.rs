//! Actions, the pooled response buffers, and the three queues.
//!
//! An action pairs an inbound request with a response slot. Handlers either
//! fill the slot and push the action onto the transmit queue, or mark the
//! completion code and push it onto the reclaim queue. Every pool checkout
//! ends up back in the pool through one of those two paths.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

/// Capacity of a pooled message payload buffer. Large enough for a full
/// config read plus the tunnel envelope.
pub const MAX_MSG_SIZE: usize = 16384;

/// Response slots in the transmit pool.
pub const POOL_SLOTS: usize = 64;

/// MCTP message types carried in the transport type byte.
pub const MT_CXL_FMAPI: u8 = 0x07;
pub const MT_CXL_CCI: u8 = 0x08;
pub const MT_EMULATOR: u8 = 0x7E;

/// A framed MCTP message.
#[derive(Debug)]
pub struct MctpMessage {
    pub dst: u8,
    pub src: u8,
    pub tag: u8,
    pub mtype: u8,
    /// Message body; pooled buffers keep `MAX_MSG_SIZE` capacity.
    pub payload: Vec<u8>,
    /// Valid prefix of `payload`.
    pub len: usize,
}

impl MctpMessage {
    pub fn body(&self) -> &[u8] {
        &self.payload[..self.len]
    }
}

/// A unit of work travelling between the transport and the handlers.
#[derive(Debug)]
pub struct Action {
    pub req: MctpMessage,
    pub rsp: Option<MctpMessage>,
    /// 0 on success; set to 1 on the fail-path before reclaim.
    pub completion_code: u8,
}

impl Action {
    pub fn new(req: MctpMessage) -> Self {
        Action {
            req,
            rsp: None,
            completion_code: 0,
        }
    }
}

/// Bounded pool of response message buffers.
///
/// `checkout` is non-blocking: an empty pool is the "response slot
/// exhausted" transport failure, handled by the caller's fail-path.
#[derive(Clone)]
pub struct MsgPool {
    tx: Sender<MctpMessage>,
    rx: Receiver<MctpMessage>,
}

impl MsgPool {
    pub fn new(slots: usize) -> Self {
        let (tx, rx) = bounded(slots);
        for _ in 0..slots {
            let msg = MctpMessage {
                dst: 0,
                src: 0,
                tag: 0,
                mtype: 0,
                payload: vec![0; MAX_MSG_SIZE],
                len: 0,
            };
            tx.send(msg).expect("pool channel sized to slots");
        }
        MsgPool { tx, rx }
    }

    pub fn checkout(&self) -> Option<MctpMessage> {
        match self.rx.try_recv() {
            Ok(msg) => Some(msg),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn checkin(&self, mut msg: MctpMessage) {
        msg.len = 0;
        msg.dst = 0;
        msg.src = 0;
        msg.tag = 0;
        msg.mtype = 0;
        // A full or closed pool just drops the buffer.
        let _ = self.tx.try_send(msg);
    }

    pub fn available(&self) -> usize {
        self.rx.len()
    }
}

/// The queue fabric shared by the transport and the dispatcher: receive,
/// transmit, and action-reclaim queues plus the response pool.
pub struct Transport {
    pub pool: MsgPool,
    pub rxq_tx: Sender<Action>,
    pub rxq_rx: Receiver<Action>,
    pub tmq_tx: Sender<Action>,
    pub tmq_rx: Receiver<Action>,
    pub acq_tx: Sender<Action>,
    pub acq_rx: Receiver<Action>,
}

impl Transport {
    pub fn new(slots: usize) -> Self {
        let (rxq_tx, rxq_rx) = bounded(slots);
        let (tmq_tx, tmq_rx) = bounded(slots);
        let (acq_tx, acq_rx) = bounded(slots);
        Transport {
            pool: MsgPool::new(slots),
            rxq_tx,
            rxq_rx,
            tmq_tx,
            tmq_rx,
            acq_tx,
            acq_rx,
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Transport::new(POOL_SLOTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhausts_and_refills() {
        let pool = MsgPool::new(2);
        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        assert!(pool.checkout().is_none());
        pool.checkin(a);
        pool.checkin(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn checkin_resets_message_fields() {
        let pool = MsgPool::new(1);
        let mut msg = pool.checkout().unwrap();
        msg.tag = 9;
        msg.len = 100;
        pool.checkin(msg);
        let msg = pool.checkout().unwrap();
        assert_eq!(msg.tag, 0);
        assert_eq!(msg.len, 0);
        assert_eq!(msg.payload.len(), MAX_MSG_SIZE);
    }
}
