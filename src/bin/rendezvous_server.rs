use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_channel::mpsc::unbounded;
use futures_util::{future, StreamExt, TryStreamExt};
use log::{debug, error};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{Error, Message, Result};

use wormhole_relay::config::RendezvousConfig;
use wormhole_relay::message::{parse_client_frame, extract_id, ServerMessage};
use wormhole_relay::rendezvous::connection::Connection;
use wormhole_relay::rendezvous::RendezvousServer;
use wormhole_relay::store::SqliteStore;

async fn accept_connection(server: Arc<RendezvousServer>, peer: SocketAddr, stream: TcpStream) {
    if let Err(e) = handle_connection(server, peer, stream).await {
        match e {
            Error::ConnectionClosed | Error::Protocol(_) | Error::Utf8 => (),
            err => error!("error processing connection: {err}"),
        }
    }
}

async fn handle_connection(
    server: Arc<RendezvousServer>,
    peer: SocketAddr,
    stream: TcpStream,
) -> Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    debug!("new WebSocket connection: {peer}");
    let (ws_sender, ws_receiver) = ws_stream.split();
    let (tx, rx) = unbounded();
    let mut connection = Connection::new(tx);
    connection.connect(&server);

    let handle_incoming = ws_receiver
        .try_filter(|msg| future::ready(msg.is_binary() || msg.is_text()))
        .try_for_each(|ws_msg| {
            let server = &server;
            let connection = &mut connection;
            async move {
                let raw: serde_json::Value = match &ws_msg {
                    Message::Text(s) => match serde_json::from_str(s) {
                        Ok(v) => v,
                        Err(_) => return Ok(()),
                    },
                    Message::Binary(v) => match serde_json::from_slice(v) {
                        Ok(v) => v,
                        Err(_) => return Ok(()),
                    },
                    _ => unreachable!(),
                };

                match parse_client_frame(&raw) {
                    Ok(msg) => {
                        debug!("received {:?}", msg.ty);
                        connection.ack(&msg);
                        connection.dispatch(server, &msg).await;
                    }
                    Err(e) => {
                        let id = extract_id(&raw);
                        connection.ack_id(id.clone());
                        connection.send_error(id, raw, &e.to_string());
                    }
                }
                Ok(())
            }
        });

    let forward_to_websocket = rx
        .map(|msg: ServerMessage| {
            Ok(Message::Text(
                serde_json::to_string(&msg).expect("server message always serializes"),
            ))
        })
        .forward(ws_sender);

    future::select(handle_incoming, forward_to_websocket).await;

    connection.disconnect(&server).await;

    Ok(())
}

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();
    let config = RendezvousConfig::parse();

    let store = SqliteStore::connect(&config.db_url)
        .await
        .expect("failed to open store");
    let server = Arc::new(RendezvousServer::new(
        Arc::new(store),
        config.blur_usage,
        config.advertise_version.clone(),
    ));

    let prune_interval = Duration::from_secs_f64(config.prune_interval.max(1.0));
    tokio::spawn(
        server
            .clone()
            .run_pruning_loop(prune_interval, config.channel_expiration),
    );

    let listener = TcpListener::bind(config.listen.as_str())
        .await
        .unwrap_or_else(|e| panic!("failed to bind {}: {e}", config.listen));
    debug!("rendezvous server listening on {}", config.listen);

    while let Ok((stream, _)) = listener.accept().await {
        let peer = stream
            .peer_addr()
            .expect("connected streams should have a peer address");
        debug!("peer address: {peer}");
        tokio::spawn(accept_connection(server.clone(), peer, stream));
    }

    Ok(())
}
