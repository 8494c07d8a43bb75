//! Mailbox: message log, listener fan-out, open/close lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use futures_channel::mpsc::UnboundedSender;

use crate::error::ProtocolError;
use crate::message::{Mood, Phase, ServerMessage, ServerMessageType};
use crate::store::{Store, StoredMessage};

/// A message already added to a mailbox, immutable and structurally compared.
#[derive(Debug, Clone, PartialEq)]
pub struct SidedMessage {
    pub side: String,
    pub phase: Phase,
    pub body: Vec<u8>,
    pub server_rx: f64,
    pub msg_id: String,
}

impl SidedMessage {
    fn to_server_message(&self) -> ServerMessage {
        ServerMessage::new(
            Some(self.msg_id.clone()),
            Some(self.server_rx),
            ServerMessageType::Message {
                side: self.side.clone(),
                phase: self.phase.clone(),
                body: self.body.clone(),
            },
        )
    }
}

/// A connection's registration on a mailbox. Never persisted.
pub struct Listener {
    pub handle: String,
    sender: UnboundedSender<ServerMessage>,
}

/// One side's open/close state on a mailbox.
#[derive(Debug, Clone)]
pub struct MailboxSide {
    pub side: String,
    pub opened: bool,
    pub added: f64,
    pub mood: Option<String>,
}

/// A mailbox: the message log plus the currently-registered listeners.
pub struct Mailbox {
    pub id: String,
    pub for_nameplate: bool,
    pub updated: f64,
    messages: Vec<SidedMessage>,
    pub sides: Vec<MailboxSide>,
    listeners: HashMap<String, Listener>,
}

impl Mailbox {
    pub fn new(id: String, for_nameplate: bool, now: f64) -> Self {
        Mailbox {
            id,
            for_nameplate,
            updated: now,
            messages: Vec::new(),
            sides: Vec::new(),
            listeners: HashMap::new(),
        }
    }

    fn active_side_count(&self) -> usize {
        self.sides.iter().filter(|s| s.opened).count()
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    /// Idempotent open for `(self, side)`: the first open records `added`;
    /// later opens by the same side are no-ops. A third distinct side is
    /// recorded but fails with [`ProtocolError::Crowded`].
    pub async fn open(
        &mut self,
        app_id: &str,
        side: &str,
        now: f64,
        store: &Arc<dyn Store>,
    ) -> Result<(), ProtocolError> {
        if self.sides.iter().any(|s| s.side == side) {
            return Ok(());
        }

        let crowded = self.active_side_count() >= 2;
        self.sides.push(MailboxSide {
            side: side.to_owned(),
            opened: true,
            added: now,
            mood: None,
        });
        store
            .upsert_mailbox_side(app_id, &self.id, side, true, now, None)
            .await
            .ok();

        if crowded {
            Err(ProtocolError::Crowded)
        } else {
            Ok(())
        }
    }

    /// Persist and fan out a new message to every registered listener.
    pub async fn add_message(&mut self, app_id: &str, msg: SidedMessage, store: &Arc<dyn Store>) {
        self.updated = msg.server_rx;
        store
            .add_message(&StoredMessage {
                app_id: app_id.to_owned(),
                mailbox_id: self.id.clone(),
                side: msg.side.clone(),
                phase: msg.phase.as_string(),
                body: msg.body.clone(),
                server_rx: msg.server_rx,
                msg_id: msg.msg_id.clone(),
            })
            .await
            .ok();

        let forward = msg.to_server_message();
        for listener in self.listeners.values() {
            let _ = listener.sender.unbounded_send(forward.clone());
        }
        self.messages.push(msg);
    }

    /// Register a listener, returning every message already in the mailbox
    /// (in insertion order) so the caller can replay them before future adds.
    pub fn add_listener(
        &mut self,
        handle: String,
        sender: UnboundedSender<ServerMessage>,
    ) -> Vec<SidedMessage> {
        self.listeners.insert(handle.clone(), Listener { handle, sender });
        self.messages.clone()
    }

    pub fn remove_listener(&mut self, handle: &str) {
        self.listeners.remove(handle);
    }

    /// Mark `side` closed with `mood`. Never opened: silent. Returns `true`
    /// when this close emptied the mailbox (caller should summarize/delete).
    pub async fn close(
        &mut self,
        app_id: &str,
        side: &str,
        mood: Option<Mood>,
        now: f64,
        store: &Arc<dyn Store>,
    ) -> bool {
        let Some(s) = self.sides.iter_mut().find(|s| s.side == side) else {
            return false;
        };
        s.opened = false;
        s.mood = mood.map(|m| m.as_str().to_owned());
        store
            .upsert_mailbox_side(app_id, &self.id, side, false, s.added, s.mood.as_deref())
            .await
            .ok();
        let _ = now;
        self.active_side_count() == 0
    }

    /// Invoke no listener-stop hook (there is none to invoke in the channel
    /// model -- dropping the sender closes the receiver). Draining the
    /// `listeners` map drops every sender, which signals each connection's
    /// forwarding task to stop.
    pub fn shutdown(&mut self) {
        self.listeners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use futures_channel::mpsc::unbounded;
    use futures_util::StreamExt;

    async fn store() -> Arc<dyn Store> {
        Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap())
    }

    #[tokio::test]
    async fn fan_out_and_replay() {
        let store = store().await;
        let mut mb = Mailbox::new("m".into(), false, 0.0);
        mb.open("app", "s1", 0.0, &store).await.unwrap();

        let (tx1, mut rx1) = unbounded();
        let replay = mb.add_listener("h1".into(), tx1);
        assert!(replay.is_empty());

        mb.add_message(
            "app",
            SidedMessage {
                side: "s1".into(),
                phase: Phase::Message(0),
                body: b"b".to_vec(),
                server_rx: 1.0,
                msg_id: "id1".into(),
            },
            &store,
        )
        .await;

        let (tx2, mut rx2) = unbounded();
        let replay2 = mb.add_listener("h2".into(), tx2);
        assert_eq!(replay2.len(), 1);

        mb.add_message(
            "app",
            SidedMessage {
                side: "s1".into(),
                phase: Phase::Message(1),
                body: b"b2".to_vec(),
                server_rx: 2.0,
                msg_id: "id2".into(),
            },
            &store,
        )
        .await;

        let m1 = rx1.next().await.unwrap();
        assert!(matches!(m1.ty, ServerMessageType::Message { .. }));
        let m2 = rx1.next().await.unwrap();
        assert!(matches!(m2.ty, ServerMessageType::Message { .. }));
        let m3 = rx2.next().await.unwrap();
        assert!(matches!(m3.ty, ServerMessageType::Message { .. }));
    }

    #[tokio::test]
    async fn third_open_is_crowded() {
        let store = store().await;
        let mut mb = Mailbox::new("m".into(), false, 0.0);
        mb.open("app", "s1", 0.0, &store).await.unwrap();
        mb.open("app", "s2", 1.0, &store).await.unwrap();
        let err = mb.open("app", "s3", 2.0, &store).await.unwrap_err();
        assert_eq!(err, ProtocolError::Crowded);
        assert_eq!(mb.sides.len(), 3);
    }

    #[tokio::test]
    async fn close_unopened_is_silent() {
        let store = store().await;
        let mut mb = Mailbox::new("m".into(), false, 0.0);
        assert!(!mb.close("app", "never-opened", None, 0.0, &store).await);
    }

    #[tokio::test]
    async fn close_last_side_reports_empty() {
        let store = store().await;
        let mut mb = Mailbox::new("m".into(), false, 0.0);
        mb.open("app", "s1", 0.0, &store).await.unwrap();
        assert!(mb.close("app", "s1", Some(Mood::Happy), 1.0, &store).await);
    }
}
