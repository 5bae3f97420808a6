use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::mapref::entry::Entry;
use foldhash::fast::RandomState;
use tokio::sync::{Notify, Semaphore, mpsc, mpsc::error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::{
    CALL_WINDOW, Message,
    error::{Error, ErrorKind, Result},
};

struct CallEntry {
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
    /// Send credit granted by the peer.
    credits: Arc<Semaphore>,
}

/// In-flight calls of one connection, keyed by call id.
///
/// The reader task routes inbound frames through this table. Entries are
/// removed by the [`CallGuard`] held by whoever owns the call.
#[derive(Default)]
pub(crate) struct CallTable {
    index: AtomicU64,
    calls: dashmap::DashMap<u64, CallEntry, RandomState>,
    drained: Notify,
}

/// Removes its call from the table on drop.
#[derive(Debug)]
pub(crate) struct CallGuard {
    table: Arc<CallTable>,
    callid: u64,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.table.remove(self.callid);
    }
}

impl CallTable {
    /// Client-side call ids start at 1.
    pub fn alloc_id(&self) -> u64 {
        self.index.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// # Errors
    ///
    /// Returns `Protocol` if the call id is already in use.
    pub fn insert(
        self: &Arc<Self>,
        callid: u64,
        tx: mpsc::Sender<Message>,
        cancel: CancellationToken,
        credits: Arc<Semaphore>,
    ) -> Result<CallGuard> {
        match self.calls.entry(callid) {
            Entry::Occupied(_) => Err(Error::new(
                ErrorKind::Protocol,
                format!("duplicate call id: {callid}"),
            )),
            Entry::Vacant(entry) => {
                entry.insert(CallEntry {
                    tx,
                    cancel,
                    credits,
                });
                Ok(CallGuard {
                    table: self.clone(),
                    callid,
                })
            }
        }
    }

    /// Delivers a frame to its call without waiting.
    ///
    /// Frames for unknown or finished calls are dropped.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` and cancels the call if its queue is full, which
    /// only happens when the peer sends past its credit.
    pub fn post(&self, callid: u64, msg: Message) -> Result<()> {
        let Some(entry) = self.calls.get(&callid) else {
            tracing::debug!("drop frame for unknown call {callid}");
            return Ok(());
        };
        match entry.tx.try_send(msg) {
            Ok(()) | Err(TrySendError::Closed(_)) => Ok(()),
            Err(TrySendError::Full(_)) => {
                entry.cancel.cancel();
                Err(Error::new(
                    ErrorKind::Protocol,
                    format!("call {callid} overran its receive window"),
                ))
            }
        }
    }

    /// Adds send credit returned by the peer.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` and cancels the call if the credit would exceed
    /// [`CALL_WINDOW`].
    pub fn grant(&self, callid: u64, credit: usize) -> Result<()> {
        let Some(entry) = self.calls.get(&callid) else {
            return Ok(());
        };
        if entry.credits.available_permits().saturating_add(credit) > CALL_WINDOW {
            entry.cancel.cancel();
            return Err(Error::new(
                ErrorKind::Protocol,
                format!("call {callid} was granted {credit} credits beyond its window"),
            ));
        }
        entry.credits.add_permits(credit);
        Ok(())
    }

    pub fn cancel(&self, callid: u64) {
        if let Some(entry) = self.calls.get(&callid) {
            entry.cancel.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Resolves once no call is in flight.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.calls.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn remove(&self, callid: u64) {
        self.calls.remove(&callid);
        if self.calls.is_empty() {
            self.drained.notify_waiters();
        }
    }
}

impl std::fmt::Debug for CallTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallTable")
            .field("calls", &self.calls.len())
            .finish()
    }
}
