//! Registered aliases and the message channels they can be reached on.
//!
//! Every operation holds the registry lock for its whole duration, fan-out
//! included, so the set of registered aliases has a single linear history.
//! Fan-out only enqueues onto each receiver's [`Outbox`]; writing to the
//! socket happens on the receiving session's own task.

use std::collections::HashMap;

use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::protocol::notice;

/// Sending side of a client's message channel.
///
/// Each outbox is drained by exactly one writer, which keeps concurrent
/// notices from different sessions from interleaving inside a frame.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<String>,
}

impl Outbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues `text` for the client. Returns false once the channel is gone.
    pub fn deliver(&self, text: impl Into<String>) -> bool {
        self.tx.send(text.into()).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnicastError {
    SelfMessage,
    UnknownAlias,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered;

#[derive(Debug, Default)]
pub struct AliasRegistry {
    entries: Mutex<HashMap<String, Outbox>>,
}

impl AliasRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `alias` to `outbox` if nobody holds it yet, then tells every
    /// other registered alias about the newcomer.
    pub async fn register(&self, alias: &str, outbox: Outbox) -> Result<(), RegisterError> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(alias) {
            return Err(RegisterError::AlreadyExists);
        }

        fan_out(entries.iter(), &notice::joined(alias));
        entries.insert(alias.to_string(), outbox);
        Ok(())
    }

    /// Removes `alias` and announces the departure to everyone left.
    ///
    /// Returns whether the alias was registered; removing an unknown alias
    /// does nothing.
    pub async fn unregister(&self, alias: &str) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.remove(alias).is_none() {
            return false;
        }

        fan_out(entries.iter(), &notice::departed(alias));
        true
    }

    pub async fn lookup(&self, alias: &str) -> Option<Outbox> {
        self.entries.lock().await.get(alias).cloned()
    }

    /// Best-effort delivery of `text` to every registered alias except
    /// `exclude`. Returns how many outboxes accepted it.
    pub async fn broadcast(&self, exclude: Option<&str>, text: &str) -> usize {
        let entries = self.entries.lock().await;
        fan_out(
            entries
                .iter()
                .filter(|(alias, _)| Some(alias.as_str()) != exclude),
            text,
        )
    }

    /// Delivers a direct message from `sender` to `receiver`.
    pub async fn unicast(
        &self,
        sender: &str,
        receiver: &str,
        text: &str,
    ) -> Result<Delivered, UnicastError> {
        if sender == receiver {
            return Err(UnicastError::SelfMessage);
        }

        let entries = self.entries.lock().await;
        let outbox = entries.get(receiver).ok_or(UnicastError::UnknownAlias)?;
        if !outbox.deliver(notice::direct(sender, text)) {
            debug!(%receiver, "outbox closed; direct message dropped");
        }
        Ok(Delivered)
    }

    /// Registered aliases, sorted.
    pub async fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        aliases.sort();
        aliases
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

fn fan_out<'a>(entries: impl Iterator<Item = (&'a String, &'a Outbox)>, text: &str) -> usize {
    let mut delivered = 0;
    for (alias, outbox) in entries {
        if outbox.deliver(text) {
            delivered += 1;
        } else {
            debug!(%alias, "outbox closed; notice dropped");
        }
    }
    delivered
}
