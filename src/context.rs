//! Shared channel context injected into dependent components.
//!
//! Pipelines, the dispatcher, and the coordinator never hold the channel
//! itself; they hold this context, which carries the channel id, the
//! monotonic fault slot, and the close trigger. That breaks the reference
//! cycles a back-pointer would create.

use std::sync::{
    Mutex,
    atomic::{AtomicU64, Ordering},
};

use log::{debug, warn};
use tokio::sync::mpsc;

use crate::error::CommError;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-wide unique channel id.
#[must_use]
pub(crate) fn next_channel_id() -> u64 { NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed) }

/// Back-channel handed to every component of a channel.
#[derive(Debug)]
pub(crate) struct ChannelContext {
    id: u64,
    call_counter: AtomicU64,
    fault: Mutex<Option<CommError>>,
    close_tx: mpsc::Sender<CommError>,
}

impl ChannelContext {
    pub(crate) fn new(id: u64, close_tx: mpsc::Sender<CommError>) -> Self {
        Self {
            id,
            call_counter: AtomicU64::new(1),
            fault: Mutex::new(None),
            close_tx,
        }
    }

    pub(crate) fn id(&self) -> u64 { self.id }

    /// Next value of the per-channel call counter.
    pub(crate) fn next_call_seq(&self) -> u64 { self.call_counter.fetch_add(1, Ordering::Relaxed) }

    /// Record the close reason and poke the channel supervisor.
    ///
    /// The first reason wins; later reasons are logged and discarded, so the
    /// fault a caller observes never changes once set.
    pub(crate) fn trigger_close(&self, reason: CommError) {
        {
            let mut fault = self.fault.lock().expect("fault slot poisoned");
            match fault.as_ref() {
                None => {
                    debug!(
                        "channel {}: closing ({:?}: {})",
                        self.id, reason.code, reason.message
                    );
                    *fault = Some(reason.clone());
                }
                Some(first) => {
                    warn!(
                        "channel {}: ignoring late close reason {:?} (already {:?})",
                        self.id, reason.code, first.code
                    );
                    return;
                }
            }
        }
        let _ = self.close_tx.try_send(reason);
    }

    /// The recorded close reason, if any.
    pub(crate) fn close_reason(&self) -> Option<CommError> {
        self.fault.lock().expect("fault slot poisoned").clone()
    }
}
