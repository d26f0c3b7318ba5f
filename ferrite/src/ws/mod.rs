//! WebSocket (RFC 6455) server. Attaches to an HTTP transaction after a
//! successful Upgrade handshake, reassembles fragmented messages, and
//! serializes outbound messages with fragmentation and control-frame
//! interleaving.

pub mod frame;
pub mod server;

pub use frame::Opcode;
pub use server::{Server, Socket};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::http;
use crate::http::{HeaderField, StatusCode, Transaction};
use crate::io::buffer::Buffer;

const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Close code for a peer that vanished without a close handshake. Never
/// appears on the wire.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Close code for protocol violations.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Reserved "no close code present" value.
pub const CLOSE_NO_STATUS: u16 = 1005;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::Connecting => "Connecting",
            State::Open => "Open",
            State::Closing => "Closing",
            State::Closed => "Closed",
        }
    }
}

/// One application message: text or binary.
#[derive(Debug)]
pub enum Message {
    Text(String),
    Binary(Buffer),
}

impl Message {
    pub fn len(&self) -> usize {
        match self {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        0 == self.len()
    }
}

/// The offered subprotocols when the transaction is a well-formed
/// WebSocket upgrade request: a GET with `Connection: upgrade`,
/// `Upgrade: websocket`, `Sec-WebSocket-Version: 13`, a key and a
/// non-empty protocol list.
pub fn is_upgrade(transaction: &Transaction) -> Option<Vec<String>> {
    let token = http::is_upgrade(transaction)?;
    if !token.eq_ignore_ascii_case("websocket") {
        return None;
    }

    let version = transaction.request_value("Sec-WebSocket-Version", 0)?;
    if "13" != version.trim() {
        return None;
    }

    transaction.request_value("Sec-WebSocket-Key", 0)?;

    let protocols = transaction.request_value("Sec-WebSocket-Protocol", 0)?;
    let protocols: Vec<String> = protocols
        .split(',')
        .map(|protocol| protocol.trim().to_string())
        .filter(|protocol| !protocol.is_empty())
        .collect();

    match protocols.is_empty() {
        true => None,
        false => Some(protocols),
    }
}

/// Completes the handshake with `101 Switching Protocols`, accepting the
/// selected subprotocol. The caller detaches the connection through
/// `Transaction::upgraded` from the end-of-transaction callback.
pub fn upgrade(transaction: &Transaction, subprotocol: &str) {
    let key = transaction
        .request_value("Sec-WebSocket-Key", 0)
        .expect("not a websocket upgrade request");

    transaction.respond(
        StatusCode::SwitchingProtocols,
        &[
            HeaderField::new("Connection", "upgrade"),
            HeaderField::new("Upgrade", "websocket"),
            HeaderField::new("Sec-WebSocket-Accept", accept_key(key.trim())),
            HeaderField::new("Sec-WebSocket-Protocol", subprotocol),
        ],
        None,
    );
}

/// The `Sec-WebSocket-Accept` value for a request key.
pub fn accept_key(key: &str) -> String {
    let mut digest = Sha1::new();
    digest.update(key.as_bytes());
    digest.update(ACCEPT_GUID.as_bytes());
    BASE64.encode(digest.finalize())
}
