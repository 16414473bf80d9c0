//! Latest-value write slot.
//!
//! Holds at most one unsent characteristic write per link. Putting a new
//! payload replaces one that has not been picked up yet, so a slow link
//! always sends the newest color instead of working through a backlog.

use crate::infrastructure::bluetooth::protocol::WriteType;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
    pub write_type: WriteType,
}

/// Producer side, owned by the adapter
#[derive(Debug)]
pub struct WriteSlot {
    tx: watch::Sender<Option<PendingWrite>>,
}

/// Consumer side, owned by the link task
#[derive(Debug)]
pub struct WriteSlotReceiver {
    rx: watch::Receiver<Option<PendingWrite>>,
}

pub fn write_slot() -> (WriteSlot, WriteSlotReceiver) {
    let (tx, rx) = watch::channel(None);
    (WriteSlot { tx }, WriteSlotReceiver { rx })
}

impl WriteSlot {
    /// Replace any unsent write. Returns `false` once the link task is gone.
    pub fn put(&self, write: PendingWrite) -> bool {
        if self.tx.is_closed() {
            return false;
        }
        self.tx.send_replace(Some(write));
        true
    }
}

impl WriteSlotReceiver {
    /// Wait for the newest write not yet taken; `None` once the slot is
    /// dropped with nothing left to send.
    pub async fn next(&mut self) -> Option<PendingWrite> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(write) = self.rx.borrow_and_update().clone() {
                return Some(write);
            }
        }
    }
}
