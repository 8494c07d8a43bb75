//! Transit relay: a bare TCP pairing service, independent of the rendezvous
//! WebSocket protocol.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};

use crate::error::TransitError;
use crate::message::now;
use crate::store::{Store, TransitUsage};

const HANDSHAKE_PREFIX: &[u8] = b"please relay ";
const HANDSHAKE_LEN: usize = 78;
const HTTP_FALLBACK_BODY: &str = "Wormhole Relay\n";

/// Round `bytes` to the blurred bucket used for `transit_usage.total_bytes`.
pub fn blur_size(bytes: u64) -> u64 {
    fn round_up(n: u64, step: u64) -> u64 {
        n.div_ceil(step) * step
    }

    if bytes == 0 {
        0
    } else if bytes <= 10_000 {
        10_000
    } else if bytes <= 1_000_000 {
        round_up(bytes, 10_000)
    } else if bytes <= 1_000_000_000 {
        round_up(bytes, 1_000_000)
    } else {
        round_up(bytes, 100_000_000)
    }
}

/// Shared pairing table: a token maps to a [`oneshot::Sender`] that hands the
/// second arrival's socket to whichever connection got there first, which
/// then performs the actual relay.
#[derive(Default)]
pub struct TransitState {
    waiting: Mutex<HashMap<String, oneshot::Sender<TcpStream>>>,
}

impl TransitState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Accept loop: spawn one task per inbound connection.
pub async fn run(listener: TcpListener, state: Arc<TransitState>, store: Arc<dyn Store>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!("transit accept error: {e}");
                continue;
            }
        };
        debug!("transit connection from {peer}");
        let state = state.clone();
        let store = store.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state, store).await {
                debug!("transit connection from {peer} ended: {e}");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    state: Arc<TransitState>,
    store: Arc<dyn Store>,
) -> std::io::Result<()> {
    let mut peek_buf = [0u8; 256];
    let n_peek = stream.peek(&mut peek_buf).await?;

    if n_peek >= 4 && &peek_buf[..4] == b"GET " {
        return serve_http_fallback(&mut stream).await;
    }

    if n_peek > HANDSHAKE_LEN {
        stream.write_all(TransitError::Impatient.wire_line().as_bytes()).await?;
        return Ok(());
    }

    let mut handshake = [0u8; HANDSHAKE_LEN];
    if stream.read_exact(&mut handshake).await.is_err() {
        return Ok(());
    }

    let token = match parse_handshake(&handshake) {
        Some(token) => token,
        None => {
            stream
                .write_all(TransitError::BadHandshake.wire_line().as_bytes())
                .await?;
            return Ok(());
        }
    };

    stream.write_all(b"ok\n").await?;

    let started = now();
    let partner = {
        let mut waiting = state.waiting.lock().await;
        if let Some(sender) = waiting.remove(&token) {
            Some(sender)
        } else {
            None
        }
    };

    match partner {
        Some(sender) => {
            // We are the second arrival: hand our socket to the parked
            // connection, which owns the relay from here.
            let _ = sender.send(stream);
            Ok(())
        }
        None => park_and_relay(stream, token, state, store, started).await,
    }
}

/// Park this connection in the waiting table and either relay (once a
/// partner hands over its socket) or record a lonely close (if our own
/// socket closes first).
async fn park_and_relay(
    mut stream: TcpStream,
    token: String,
    state: Arc<TransitState>,
    store: Arc<dyn Store>,
    started: f64,
) -> std::io::Result<()> {
    let (tx, rx) = oneshot::channel();
    {
        let mut waiting = state.waiting.lock().await;
        waiting.insert(token.clone(), tx);
    }

    let mut idle_buf = [0u8; 1];
    tokio::select! {
        read_result = stream.read(&mut idle_buf) => {
            state.waiting.lock().await.remove(&token);
            let result = match read_result {
                Ok(0) | Err(_) => "lonely",
                Ok(_) => "errory", // a parked connection isn't expected to send data before pairing
            };
            record_usage(&store, started, 0, result).await;
            Ok(())
        }
        partner = rx => {
            match partner {
                Ok(partner_stream) => relay(stream, partner_stream, store, started).await,
                Err(_) => Ok(()),
            }
        }
    }
}

async fn relay(
    mut a: TcpStream,
    mut b: TcpStream,
    store: Arc<dyn Store>,
    started: f64,
) -> std::io::Result<()> {
    let result = tokio::io::copy_bidirectional(&mut a, &mut b).await;
    let (total_bytes, outcome) = match result {
        Ok((a_to_b, b_to_a)) => (a_to_b + b_to_a, "happy"),
        Err(_) => (0, "errory"),
    };
    record_usage(&store, started, total_bytes, outcome).await;
    Ok(())
}

async fn record_usage(store: &Arc<dyn Store>, started: f64, total_bytes: u64, result: &'static str) {
    let usage = TransitUsage {
        started,
        total_time: now() - started,
        total_bytes: blur_size(total_bytes),
        result,
    };
    store.insert_transit_usage(&usage).await.ok();
}

async fn serve_http_fallback(stream: &mut TcpStream) -> std::io::Result<()> {
    let body = HTTP_FALLBACK_BODY;
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await
}

/// Validate the literal `please relay <64 hex>\n` handshake and extract the
/// token, rejecting anything that doesn't match byte-for-byte.
fn parse_handshake(handshake: &[u8; HANDSHAKE_LEN]) -> Option<String> {
    if &handshake[..HANDSHAKE_PREFIX.len()] != HANDSHAKE_PREFIX {
        return None;
    }
    let token_bytes = &handshake[HANDSHAKE_PREFIX.len()..HANDSHAKE_PREFIX.len() + 64];
    if handshake[HANDSHAKE_LEN - 1] != b'\n' {
        return None;
    }
    if !token_bytes.iter().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b)) {
        return None;
    }
    Some(String::from_utf8(token_bytes.to_vec()).expect("validated ascii hex"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    #[test]
    fn blur_size_breakpoints() {
        assert_eq!(blur_size(0), 0);
        assert_eq!(blur_size(1), 10_000);
        assert_eq!(blur_size(10_001), 20_000);
        assert_eq!(blur_size(1_000_001), 2_000_000);
        assert_eq!(blur_size(1_050_000_000), 1_100_000_000);
    }

    #[test]
    fn parse_handshake_accepts_valid() {
        let token = "a".repeat(64);
        let line = format!("please relay {token}\n");
        let bytes: [u8; HANDSHAKE_LEN] = line.as_bytes().try_into().unwrap();
        assert_eq!(parse_handshake(&bytes), Some(token));
    }

    #[test]
    fn parse_handshake_rejects_wrong_verb() {
        let token = "a".repeat(64);
        let line = format!("please DELAY {token}\n");
        let bytes: [u8; HANDSHAKE_LEN] = line.as_bytes().try_into().unwrap();
        assert_eq!(parse_handshake(&bytes), None);
    }

    async fn store() -> Arc<dyn Store> {
        Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap())
    }

    #[tokio::test]
    async fn pairs_two_connections_and_relays() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(TransitState::new());
        let store = store().await;
        tokio::spawn(run(listener, state, store));

        let token = "b".repeat(64);
        let mut c1 = TcpStream::connect(addr).await.unwrap();
        c1.write_all(format!("please relay {token}\n").as_bytes())
            .await
            .unwrap();
        let mut buf = [0u8; 3];
        c1.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok\n");

        let mut c2 = TcpStream::connect(addr).await.unwrap();
        c2.write_all(format!("please relay {token}\n").as_bytes())
            .await
            .unwrap();
        let mut buf2 = [0u8; 3];
        c2.read_exact(&mut buf2).await.unwrap();
        assert_eq!(&buf2, b"ok\n");

        c1.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        c2.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");
    }

    #[tokio::test]
    async fn bad_handshake_closes_with_diagnostic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(TransitState::new());
        let store = store().await;
        tokio::spawn(run(listener, state, store));

        let token = "c".repeat(64);
        let mut c1 = TcpStream::connect(addr).await.unwrap();
        c1.write_all(format!("please DELAY {token}\n").as_bytes())
            .await
            .unwrap();
        let mut buf = Vec::new();
        c1.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"bad handshake\n");
    }
}
