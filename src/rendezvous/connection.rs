//! Per-WebSocket connection state machine: tracks what a single client has
//! bound/claimed/opened and dispatches each inbound frame against the shared
//! [`RendezvousServer`].

use std::sync::Arc;

use futures_channel::mpsc::UnboundedSender;
use log::debug;
use rand::RngCore;

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{
    now, ClientMessage, ClientMessageType, Mood, NameplateInfo, ServerMessage, ServerMessageType,
    WelcomeInfo,
};
use crate::rendezvous::mailbox::SidedMessage;
use crate::rendezvous::RendezvousServer;

/// One client's view of the protocol: which app/side it's bound as, and
/// which nameplate/mailbox it currently holds.
pub struct Connection {
    handle: String,
    sender: UnboundedSender<ServerMessage>,
    app_id: Option<String>,
    side: Option<String>,
    claimed_nameplate: Option<String>,
    open_mailbox: Option<String>,
}

impl Connection {
    pub fn new(sender: UnboundedSender<ServerMessage>) -> Self {
        let mut buf = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut buf);
        Connection {
            handle: hex::encode(buf),
            sender,
            app_id: None,
            side: None,
            claimed_nameplate: None,
            open_mailbox: None,
        }
    }

    fn send(&self, msg: ServerMessage) {
        let _ = self.sender.unbounded_send(msg);
    }

    fn require_bound(&self) -> ProtocolResult<(&str, &str)> {
        match (&self.app_id, &self.side) {
            (Some(app_id), Some(side)) => Ok((app_id.as_str(), side.as_str())),
            _ => Err(ProtocolError::MustBindFirst),
        }
    }

    /// Send the initial `welcome` frame. Called once, right after the
    /// WebSocket handshake completes, before any client frame is read.
    pub fn connect(&self, server: &RendezvousServer) {
        self.send(ServerMessage::new(
            None,
            None,
            ServerMessageType::Welcome {
                welcome: WelcomeInfo {
                    motd: None,
                    error: None,
                    permission_required: Vec::new(),
                    current_cli_version: server.advertise_version().to_owned(),
                },
            },
        ));
    }

    /// Acknowledge a successfully-parsed inbound frame, regardless of
    /// whether dispatching it later succeeds.
    pub fn ack(&self, msg: &ClientMessage) {
        self.send(ServerMessage::ack(msg.id.clone()));
    }

    /// Acknowledge a frame that failed to parse, using whatever `id` could be
    /// salvaged from the raw JSON. Every inbound frame is acked before any
    /// substantive reply, even one that never became a [`ClientMessage`].
    pub fn ack_id(&self, id: Option<String>) {
        self.send(ServerMessage::ack(id));
    }

    /// Report a frame that failed to parse at all (missing/unknown `type`,
    /// or a required field absent), echoing the raw JSON as `orig`.
    pub fn send_error(&self, id: Option<String>, orig: serde_json::Value, error: &str) {
        self.send(ServerMessage::error_raw(id, orig, error));
    }

    /// Dispatch one parsed client frame, sending either its success reply or
    /// a matching `error` frame. Mirrors the per-type match in the
    /// WebSocket handler loop.
    pub async fn dispatch(&mut self, server: &RendezvousServer, msg: &ClientMessage) {
        let result = self.dispatch_inner(server, msg).await;
        if let Err(e) = result {
            debug!("protocol error on {:?}: {}", msg.ty, e);
            self.send(e.into_message(msg));
        }
    }

    async fn dispatch_inner(&mut self, server: &RendezvousServer, msg: &ClientMessage) -> ProtocolResult<()> {
        match &msg.ty {
            ClientMessageType::SubmitPermissions => Ok(()),
            ClientMessageType::Bind { app_id, side } => self.bind(app_id, side),
            ClientMessageType::List => self.list(server).await,
            ClientMessageType::Allocate => self.allocate(server, msg).await,
            ClientMessageType::Claim { nameplate } => self.claim(server, msg, nameplate).await,
            ClientMessageType::Release { nameplate } => {
                self.release(server, msg, nameplate.as_deref()).await
            }
            ClientMessageType::Open { mailbox_id } => self.open(server, msg, mailbox_id).await,
            ClientMessageType::Add { phase, body } => self.add(server, msg, phase, body).await,
            ClientMessageType::Close { mood } => self.close(server, msg, *mood).await,
            ClientMessageType::Ping { ping } => {
                self.send(ServerMessage::new(
                    msg.id.clone(),
                    Some(now()),
                    ServerMessageType::Pong { pong: *ping },
                ));
                Ok(())
            }
        }
    }

    fn bind(&mut self, app_id: &str, side: &str) -> ProtocolResult<()> {
        if self.app_id.is_some() {
            return Err(ProtocolError::AlreadyBound);
        }
        self.app_id = Some(app_id.to_owned());
        self.side = Some(side.to_owned());
        Ok(())
    }

    async fn list(&self, server: &RendezvousServer) -> ProtocolResult<()> {
        let (app_id, _) = self.require_bound()?;
        let mut apps = server.lock_apps().await;
        let app = server.get_or_create_app(&mut apps, app_id);
        let nameplates = app
            .list_nameplate_ids()
            .into_iter()
            .map(|id| NameplateInfo { id })
            .collect();
        self.send(ServerMessage::new(
            None,
            None,
            ServerMessageType::Nameplates { nameplates },
        ));
        Ok(())
    }

    async fn allocate(&mut self, server: &RendezvousServer, msg: &ClientMessage) -> ProtocolResult<()> {
        let (app_id, side) = self.require_bound()?;
        if self.claimed_nameplate.is_some() {
            return Err(ProtocolError::AlreadyAllocated);
        }
        let (app_id, side) = (app_id.to_owned(), side.to_owned());
        let now = now();
        let mut apps = server.lock_apps().await;
        let app = server.get_or_create_app(&mut apps, &app_id);
        let nameplate = app.allocate_nameplate(&side, now, server.store()).await?;
        drop(apps);
        self.claimed_nameplate = Some(nameplate.clone());
        self.send(ServerMessage::new(
            msg.id.clone(),
            Some(now),
            ServerMessageType::Allocated { nameplate },
        ));
        Ok(())
    }

    async fn claim(
        &mut self,
        server: &RendezvousServer,
        msg: &ClientMessage,
        nameplate: &str,
    ) -> ProtocolResult<()> {
        let (app_id, side) = self.require_bound()?;
        if self.claimed_nameplate.is_some() {
            return Err(ProtocolError::AlreadyAllocated);
        }
        let (app_id, side) = (app_id.to_owned(), side.to_owned());
        let now = now();
        let mut apps = server.lock_apps().await;
        let app = server.get_or_create_app(&mut apps, &app_id);
        let mailbox_id = app
            .claim_nameplate(nameplate, &side, now, server.store())
            .await?;
        drop(apps);
        self.claimed_nameplate = Some(nameplate.to_owned());
        self.send(ServerMessage::new(
            msg.id.clone(),
            Some(now),
            ServerMessageType::Claimed { mailbox_id },
        ));
        Ok(())
    }

    async fn release(
        &mut self,
        server: &RendezvousServer,
        msg: &ClientMessage,
        nameplate_arg: Option<&str>,
    ) -> ProtocolResult<()> {
        let (app_id, side) = self.require_bound()?;
        let Some(claimed) = self.claimed_nameplate.clone() else {
            return Err(ProtocolError::MustClaimBeforeReleasing);
        };
        if let Some(arg) = nameplate_arg {
            if arg != claimed {
                return Err(ProtocolError::ReleaseMismatch);
            }
        }
        let (app_id, side) = (app_id.to_owned(), side.to_owned());
        let now = now();
        let mut apps = server.lock_apps().await;
        let app = server.get_or_create_app(&mut apps, &app_id);
        app.release_nameplate(&claimed, &side, now, server.store())
            .await;
        drop(apps);
        self.claimed_nameplate = None;
        self.send(ServerMessage::new(
            msg.id.clone(),
            Some(now),
            ServerMessageType::Released,
        ));
        Ok(())
    }

    async fn open(
        &mut self,
        server: &RendezvousServer,
        _msg: &ClientMessage,
        mailbox_id: &str,
    ) -> ProtocolResult<()> {
        let (app_id, side) = self.require_bound()?;
        if self.open_mailbox.is_some() {
            return Err(ProtocolError::MailboxAlreadyOpen);
        }
        let (app_id, side) = (app_id.to_owned(), side.to_owned());
        let now = now();
        let mut apps = server.lock_apps().await;
        let app = server.get_or_create_app(&mut apps, &app_id);
        let open_result = app.open_mailbox(mailbox_id, &side, now, server.store()).await;
        self.open_mailbox = Some(mailbox_id.to_owned());

        let replay = if let Some(mailbox) = app.get_mailbox(mailbox_id) {
            mailbox.add_listener(self.handle.clone(), self.sender.clone())
        } else {
            Vec::new()
        };
        drop(apps);

        for stored in replay {
            self.send(stored_to_server_message(&stored));
        }

        open_result
    }

    async fn add(
        &mut self,
        server: &RendezvousServer,
        msg: &ClientMessage,
        phase: &crate::message::Phase,
        body: &[u8],
    ) -> ProtocolResult<()> {
        let (app_id, side) = self.require_bound()?;
        let Some(mailbox_id) = self.open_mailbox.clone() else {
            return Err(ProtocolError::MustOpenBeforeAdding);
        };
        let (app_id, side) = (app_id.to_owned(), side.to_owned());
        let now = now();
        let msg_id = msg.id.clone().unwrap_or_default();
        let mut apps = server.lock_apps().await;
        let app = server.get_or_create_app(&mut apps, &app_id);
        app.add_message(
            &mailbox_id,
            SidedMessage {
                side,
                phase: phase.clone(),
                body: body.to_vec(),
                server_rx: now,
                msg_id,
            },
            server.store(),
        )
        .await;
        Ok(())
    }

    async fn close(
        &mut self,
        server: &RendezvousServer,
        msg: &ClientMessage,
        mood: Option<Mood>,
    ) -> ProtocolResult<()> {
        let (app_id, side) = self.require_bound()?;
        let Some(mailbox_id) = self.open_mailbox.clone() else {
            return Err(ProtocolError::MustOpenBeforeClosing);
        };
        let (app_id, side) = (app_id.to_owned(), side.to_owned());
        let now = now();
        let mut apps = server.lock_apps().await;
        let app = server.get_or_create_app(&mut apps, &app_id);
        if let Some(mailbox) = app.get_mailbox(&mailbox_id) {
            mailbox.remove_listener(&self.handle);
        }
        app.close_mailbox(&mailbox_id, &side, mood, now, server.store())
            .await;
        drop(apps);
        self.open_mailbox = None;
        self.send(ServerMessage::new(
            msg.id.clone(),
            Some(now),
            ServerMessageType::Closed,
        ));
        Ok(())
    }

    /// Socket dropped: deregister this connection's listener from whatever
    /// mailbox it had open, but do *not* release its nameplate or close its
    /// mailbox side -- that requires an explicit `close`/`release` frame.
    pub async fn disconnect(&mut self, server: &RendezvousServer) {
        if let (Some(app_id), Some(mailbox_id)) = (&self.app_id, &self.open_mailbox) {
            let mut apps = server.lock_apps().await;
            let app = server.get_or_create_app(&mut apps, app_id);
            if let Some(mailbox) = app.get_mailbox(mailbox_id) {
                mailbox.remove_listener(&self.handle);
            }
        }
    }
}

fn stored_to_server_message(msg: &SidedMessage) -> ServerMessage {
    ServerMessage::new(
        Some(msg.msg_id.clone()),
        Some(msg.server_rx),
        ServerMessageType::Message {
            side: msg.side.clone(),
            phase: msg.phase.clone(),
            body: msg.body.clone(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ClientMessageType;
    use crate::store::SqliteStore;
    use futures_channel::mpsc::unbounded;
    use futures_util::StreamExt;

    async fn server() -> RendezvousServer {
        let store: Arc<dyn crate::store::Store> =
            Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        RendezvousServer::new(store, None, "test-1.0".into())
    }

    #[tokio::test]
    async fn must_bind_before_list() {
        let server = server().await;
        let (tx, _rx) = unbounded();
        let mut conn = Connection::new(tx);
        let msg = ClientMessage::new(ClientMessageType::List);
        let err = conn.dispatch_inner(&server, &msg).await.unwrap_err();
        assert_eq!(err, ProtocolError::MustBindFirst);
    }

    #[tokio::test]
    async fn bind_twice_errors() {
        let server = server().await;
        let (tx, _rx) = unbounded();
        let mut conn = Connection::new(tx);
        conn.bind("app", "side1").unwrap();
        let err = conn.bind("app", "side1").unwrap_err();
        assert_eq!(err, ProtocolError::AlreadyBound);
    }

    #[tokio::test]
    async fn full_rendezvous_round_trip() {
        let server = server().await;
        let (tx, mut rx) = unbounded();
        let mut conn = Connection::new(tx);
        conn.bind("app", "side1").unwrap();

        let alloc_msg = ClientMessage::new(ClientMessageType::Allocate);
        conn.dispatch_inner(&server, &alloc_msg).await.unwrap();
        let allocated = rx.next().await.unwrap();
        let nameplate = match allocated.ty {
            ServerMessageType::Allocated { nameplate } => nameplate,
            other => panic!("unexpected {:?}", other),
        };

        let claim_msg = ClientMessage::new(ClientMessageType::Claim {
            nameplate: nameplate.clone(),
        });
        conn.dispatch_inner(&server, &claim_msg).await.unwrap();
        let claimed = rx.next().await.unwrap();
        let mailbox_id = match claimed.ty {
            ServerMessageType::Claimed { mailbox_id } => mailbox_id,
            other => panic!("unexpected {:?}", other),
        };

        let open_msg = ClientMessage::new(ClientMessageType::Open {
            mailbox_id: mailbox_id.clone(),
        });
        conn.dispatch_inner(&server, &open_msg).await.unwrap();
        let _ack = rx.next().await.unwrap();

        let add_msg = ClientMessage::new(ClientMessageType::Add {
            phase: crate::message::Phase::Pake,
            body: vec![1, 2, 3],
        });
        conn.dispatch_inner(&server, &add_msg).await.unwrap();
        let echoed = rx.next().await.unwrap();
        assert!(matches!(echoed.ty, ServerMessageType::Message { .. }));

        let close_msg = ClientMessage::new(ClientMessageType::Close {
            mood: Some(Mood::Happy),
        });
        conn.dispatch_inner(&server, &close_msg).await.unwrap();
        let closed = rx.next().await.unwrap();
        assert!(matches!(closed.ty, ServerMessageType::Closed));
    }
}
