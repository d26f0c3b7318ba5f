//! The HTTP/1.1 server: a listening socket whose accepted connections run
//! request/response transactions with streaming hooks for request bodies
//! and response bodies, chunked transfer, keep-alive and the Upgrade
//! handshake.
//!
//! Every connection owns staging buffers and pumps its own bytes; user
//! callbacks always run with no internal lock held, so they may call
//! back into the transaction freely.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, Ready};
use crate::http::head::{
    self, encode_chunk, find_head, parse_head, ChunkDecoder, MAX_HEAD_SIZE,
};
use crate::http::{canonicalize, ContentLength, HeaderField, StatusCode};
use crate::io::buffer::Buffer;
use crate::io::sink::Sink;
use crate::io::source::Source;
use crate::io::transport::{tls_server_config, Transport};
use crate::logging::{self, debug, trace, warn, Logger};

const READ_CHUNK: usize = 16 * 1024;
const READ_HIGH_WATER: usize = 64 * 1024;

pub type StartTransactionCallback = Arc<dyn Fn(&Transaction) + Send + Sync>;
pub type EndTransactionCallback = Arc<dyn Fn(&Transaction, bool) + Send + Sync>;
pub type ReceiveCallback = Box<dyn FnOnce(&Transaction, Buffer, usize) + Send>;
pub type SendCallback = Box<dyn FnOnce(&Transaction, Buffer, usize) + Send>;

#[derive(Clone)]
struct Callbacks {
    on_transaction_start: StartTransactionCallback,
    on_transaction_end: Option<EndTransactionCallback>,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketOptions {
    pub reuse_addr: bool,
    pub reuse_port: bool,
}

/// Server startup configuration.
pub struct ServerConfig {
    pub binding: SocketAddr,
    pub socket_options: SocketOptions,
    pub secure: bool,
    pub certificate_file: String,
    pub private_key_file: String,
    pub on_transaction_start: StartTransactionCallback,
    pub on_transaction_end: Option<EndTransactionCallback>,
}

impl ServerConfig {
    pub fn new<F>(binding: SocketAddr, on_transaction_start: F) -> ServerConfig
    where
        F: Fn(&Transaction) + Send + Sync + 'static,
    {
        ServerConfig {
            binding,
            socket_options: SocketOptions {
                reuse_addr: true,
                reuse_port: false,
            },
            secure: false,
            certificate_file: String::new(),
            private_key_file: String::new(),
            on_transaction_start: Arc::new(on_transaction_start),
            on_transaction_end: None,
        }
    }
}

/// A connection detached from its transaction after `101 Switching
/// Protocols`, ready to be handed to a new protocol owner.
pub struct Upgrade {
    /// The request's `Upgrade` token, e.g. `websocket`.
    pub protocol: String,
    pub transport: Transport,
}

enum BodyReader {
    Length(usize),
    Chunked(ChunkDecoder),
    Done,
}

impl BodyReader {
    fn of(content_length: ContentLength) -> BodyReader {
        match content_length {
            ContentLength::Length(0) => BodyReader::Done,
            ContentLength::Length(length) => BodyReader::Length(length),
            ContentLength::Chunked => BodyReader::Chunked(ChunkDecoder::new()),
        }
    }

    fn done(&self) -> bool {
        matches!(self, BodyReader::Done)
    }

    fn more(&self) -> usize {
        match self {
            BodyReader::Done => 0,
            BodyReader::Length(remaining) => *remaining,
            BodyReader::Chunked(_) => 1,
        }
    }
}

enum ResponseState {
    None,
    Streaming { chunked: bool, remaining: usize },
    Finished,
}

struct TxnState {
    handle: Transaction,
    fields: Buffer,
    callbacks: Callbacks,
    keep_alive: bool,
    body: BodyReader,
    recv: Option<(Buffer, usize, ReceiveCallback)>,
    response: ResponseState,
    pending_send: Option<(Buffer, usize, SendCallback)>,
    upgrade_requested: bool,
}

enum Phase {
    Head,
    Transacting,
    Drain,
    Closing,
}

struct ConnState {
    transport: Option<Transport>,
    fd: RawFd,
    events: Ready,
    read_buf: Buffer,
    write_buf: Buffer,
    phase: Phase,
    drain: Option<BodyReader>,
    txn: Option<TxnState>,
    upgrade_protocol: Option<String>,
    eof: bool,
    close_after_flush: bool,
    detached: bool,
    pumping: bool,
    repump: bool,
}

struct Conn {
    log: Logger,
    server: Weak<ServerInner>,
    event_loop: Weak<EventLoop>,
    state: Mutex<ConnState>,
}

struct ServerState {
    listener: Option<mio::net::TcpListener>,
    listener_fd: RawFd,
    tls: Option<Arc<rustls::ServerConfig>>,
    callbacks: Option<Callbacks>,
    path_callbacks: HashMap<String, Callbacks>,
    connections: HashMap<RawFd, Arc<Conn>>,
    transactions: HashMap<u64, Weak<Conn>>,
}

struct ServerInner {
    log: Logger,
    event_loop: Weak<EventLoop>,
    next_transaction_id: AtomicU64,
    state: Mutex<ServerState>,
}

pub struct Server {
    inner: Arc<ServerInner>,
}

/// One HTTP request/response pair. Handles are cheap clones referencing
/// the connection; all methods must be called from event loop callbacks.
#[derive(Clone)]
pub struct Transaction {
    conn: Weak<Conn>,
    pub id: u64,
    pub request_method: String,
    pub request_target: String,
    pub request_version: String,
    pub request_content_length: ContentLength,
}

enum Step {
    Idle,
    Start(StartTransactionCallback, Transaction),
    Receive(ReceiveCallback, Transaction, Buffer, usize),
    Sent(SendCallback, Transaction, Buffer, usize),
    End {
        callback: Option<EndTransactionCallback>,
        transaction: Transaction,
        failed: bool,
        keep_alive: bool,
        body: BodyReader,
        upgrade_requested: bool,
    },
    Close,
}

impl Server {
    pub fn new<'a, L>(log: L, event_loop: Weak<EventLoop>) -> Server
    where
        L: Into<Option<&'a Logger>>,
    {
        Server {
            inner: Arc::new(ServerInner {
                log: logging::child(log, "http"),
                event_loop,
                next_transaction_id: AtomicU64::new(0),
                state: Mutex::new(ServerState {
                    listener: None,
                    listener_fd: -1,
                    tls: None,
                    callbacks: None,
                    path_callbacks: HashMap::new(),
                    connections: HashMap::new(),
                    transactions: HashMap::new(),
                }),
            }),
        }
    }

    /// Registers path-specific transaction callbacks, keyed by the
    /// canonicalized target.
    pub fn add_path<F>(&self, path: &str, on_start: F, on_end: Option<EndTransactionCallback>)
    where
        F: Fn(&Transaction) + Send + Sync + 'static,
    {
        let mut state = self.inner.state.lock().unwrap();
        state.path_callbacks.insert(
            path.to_string(),
            Callbacks {
                on_transaction_start: Arc::new(on_start),
                on_transaction_end: on_end,
            },
        );
    }

    pub fn remove_path(&self, path: &str) {
        let mut state = self.inner.state.lock().unwrap();
        state.path_callbacks.remove(path);
    }

    /// Binds the listening socket and starts accepting connections.
    pub fn start(&self, config: ServerConfig) -> Result<()> {
        let event_loop = self
            .inner
            .event_loop
            .upgrade()
            .ok_or_else(|| Error::resource("event loop has gone away"))?;

        let tls = match config.secure {
            true => Some(tls_server_config(
                &config.certificate_file,
                &config.private_key_file,
            )?),
            false => None,
        };

        let listener = bind_listener(config.binding, config.socket_options)?;
        let fd = listener.as_raw_fd();

        {
            let mut state = self.inner.state.lock().unwrap();
            assert!(state.listener.is_none(), "server already started");
            state.listener = Some(listener);
            state.listener_fd = fd;
            state.tls = tls;
            state.callbacks = Some(Callbacks {
                on_transaction_start: config.on_transaction_start,
                on_transaction_end: config.on_transaction_end,
            });
        }

        let server = self.inner.clone();
        event_loop.add(fd, Ready::READ, move |_, _| {
            on_accept(&server);
            Ok(())
        })?;

        debug!(self.inner.log, "listening"; "binding" => %config.binding, "secure" => config.secure);
        Ok(())
    }

    /// Stops accepting and closes every connection.
    pub fn stop(&self) {
        let (fd, connections) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.listener.is_none() {
                return;
            }
            let fd = state.listener_fd;
            state.listener = None;
            state.listener_fd = -1;
            let connections: Vec<Arc<Conn>> = state.connections.values().cloned().collect();
            (fd, connections)
        };

        if let Some(event_loop) = self.inner.event_loop.upgrade() {
            let _ = event_loop.remove(fd);
        }

        for conn in connections {
            close_conn(&conn);
        }
    }

    /// The bound address, available after `start`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let state = self.inner.state.lock().unwrap();
        state
            .listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    /// Looks up an in-flight transaction by id.
    pub fn transaction(&self, id: u64) -> Option<Transaction> {
        let conn = {
            let state = self.inner.state.lock().unwrap();
            state.transactions.get(&id)?.upgrade()?
        };

        let state = conn.state.lock().unwrap();
        state
            .txn
            .as_ref()
            .filter(|txn| id == txn.handle.id)
            .map(|txn| txn.handle.clone())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_listener(binding: SocketAddr, options: SocketOptions) -> Result<mio::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(binding),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    if options.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    if options.reuse_port {
        socket.set_reuse_port(true)?;
    }

    socket.bind(&binding.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;

    Ok(mio::net::TcpListener::from_std(socket.into()))
}

fn on_accept(server: &Arc<ServerInner>) {
    loop {
        let accepted = {
            let state = server.state.lock().unwrap();
            let listener = match state.listener.as_ref() {
                Some(listener) => listener,
                None => return,
            };

            match listener.accept() {
                Ok((stream, peer)) => Ok((stream, peer, state.tls.clone())),
                Err(err) => Err(err),
            }
        };

        let (stream, peer, tls) = match accepted {
            Ok(accepted) => accepted,
            Err(err) if std::io::ErrorKind::WouldBlock == err.kind() => return,
            Err(err) => {
                warn!(server.log, "accept failed"; "error" => %err);
                return;
            }
        };

        let transport = match Transport::accepted(stream, tls.as_ref()) {
            Ok(transport) => transport,
            Err(err) => {
                warn!(server.log, "TLS session failed"; "error" => %err);
                continue;
            }
        };

        let event_loop = match server.event_loop.upgrade() {
            Some(event_loop) => event_loop,
            None => return,
        };

        let fd = transport.fd();
        trace!(server.log, "accepted"; "fd" => fd, "peer" => %peer);

        let conn = Arc::new(Conn {
            log: server.log.new(crate::logging::o!("fd" => fd)),
            server: Arc::downgrade(server),
            event_loop: server.event_loop.clone(),
            state: Mutex::new(ConnState {
                transport: Some(transport),
                fd,
                events: Ready::READ,
                read_buf: Buffer::new(),
                write_buf: Buffer::new(),
                phase: Phase::Head,
                drain: None,
                txn: None,
                upgrade_protocol: None,
                eof: false,
                close_after_flush: false,
                detached: false,
                pumping: false,
                repump: false,
            }),
        });

        let handler = conn.clone();
        if event_loop
            .add(fd, Ready::READ, move |_, ready| {
                on_conn_event(&handler, ready);
                Ok(())
            })
            .is_err()
        {
            continue;
        }

        let mut state = server.state.lock().unwrap();
        state.connections.insert(fd, conn);
    }
}

fn on_conn_event(conn: &Arc<Conn>, ready: Ready) {
    if ready.is_error() {
        fail_conn(conn);
        return;
    }

    if ready.is_hup() {
        let mut state = conn.state.lock().unwrap();
        state.eof = true;
        drop(state);
    }

    pump(conn);
}

/// Drives the connection state machine until nothing further can happen.
/// Steps that invoke user callbacks are executed with no lock held, then
/// the machine re-runs to absorb their effects.
fn pump(conn: &Arc<Conn>) {
    {
        let mut state = conn.state.lock().unwrap();
        if state.pumping {
            state.repump = true;
            return;
        }
        state.pumping = true;
    }

    loop {
        let step = next_step(conn);

        match step {
            Step::Idle => {
                let mut state = conn.state.lock().unwrap();
                if state.repump {
                    state.repump = false;
                    continue;
                }
                state.pumping = false;
                return;
            }
            Step::Start(callback, transaction) => {
                callback(&transaction);
            }
            Step::Receive(callback, transaction, sink, more) => {
                callback(&transaction, sink, more);
            }
            Step::Sent(callback, transaction, content, more) => {
                callback(&transaction, content, more);
            }
            Step::End {
                callback,
                transaction,
                failed,
                keep_alive,
                body,
                upgrade_requested,
            } => {
                if let Some(server) = conn.server.upgrade() {
                    let mut state = server.state.lock().unwrap();
                    state.transactions.remove(&transaction.id);
                }

                if let Some(callback) = callback {
                    callback(&transaction, failed);
                }

                post_end(conn, failed, keep_alive, body, upgrade_requested);
            }
            Step::Close => {
                close_conn(conn);
            }
        }
    }
}

fn post_end(
    conn: &Arc<Conn>,
    failed: bool,
    keep_alive: bool,
    body: BodyReader,
    upgrade_requested: bool,
) {
    let mut state = conn.state.lock().unwrap();

    if state.detached {
        // `upgraded` took the transport; only bookkeeping remains.
        state.phase = Phase::Closing;
        let fd = state.fd;
        drop(state);

        if let Some(server) = conn.server.upgrade() {
            let mut server_state = server.state.lock().unwrap();
            server_state.connections.remove(&fd);
        }
        return;
    }

    if failed || !keep_alive || upgrade_requested {
        drop(state);
        close_conn(conn);
        return;
    }

    match body.done() {
        true => {
            state.phase = Phase::Head;
        }
        false => {
            state.phase = Phase::Drain;
            state.drain = Some(body);
        }
    }
}

/// One locked pass over the machine. Returns the next unlocked action.
fn next_step(conn: &Arc<Conn>) -> Step {
    let mut guard = conn.state.lock().unwrap();
    let state = &mut *guard;

    if state.transport.is_none() {
        return Step::Idle;
    }

    // Ingress until would-block, end of stream or the high-water mark.
    if !state.eof {
        let mut chunk = [0u8; READ_CHUNK];
        while state.read_buf.available() < READ_HIGH_WATER {
            let result = state.transport.as_mut().unwrap().read(&mut chunk);
            match result {
                Err(err) if std::io::ErrorKind::WouldBlock == err.kind() => break,
                Err(err) if std::io::ErrorKind::Interrupted == err.kind() => continue,
                Err(err) => {
                    trace!(conn.log, "read failed"; "error" => %err);
                    return fail_step(state);
                }
                Ok(0) => {
                    state.eof = true;
                    break;
                }
                Ok(count) => {
                    state.read_buf.append(&chunk[..count]);
                }
            }
        }
    }

    // Advance the protocol phase with whatever is staged.
    match state.phase {
        Phase::Head => {
            if let Some(step) = advance_head(conn, state) {
                return step;
            }
        }
        Phase::Transacting => {
            if let Some(step) = advance_body(conn, state) {
                return step;
            }
        }
        Phase::Drain => {
            if let Some(step) = advance_drain(state) {
                return step;
            }
            // Drain may have flipped back to Head with pipelined bytes.
            if matches!(state.phase, Phase::Head) {
                if let Some(step) = advance_head(conn, state) {
                    return step;
                }
            }
        }
        Phase::Closing => (),
    }

    // Egress.
    loop {
        let available = state.write_buf.available();
        if 0 == available {
            break;
        }

        let result = {
            let ConnState {
                transport,
                write_buf,
                ..
            } = &mut *state;
            transport.as_mut().unwrap().write(write_buf.peek(available))
        };
        match result {
            Err(err) if std::io::ErrorKind::WouldBlock == err.kind() => break,
            Err(err) if std::io::ErrorKind::Interrupted == err.kind() => continue,
            Err(err) => {
                trace!(conn.log, "write failed"; "error" => %err);
                return fail_step(state);
            }
            Ok(count) => {
                state.write_buf.advance(count);
            }
        }
    }
    state.write_buf.compact();

    // Flush-driven completions.
    if 0 == state.write_buf.available() {
        if state.close_after_flush {
            return Step::Close;
        }

        let sent = state
            .txn
            .as_mut()
            .and_then(|txn| txn.pending_send.take().map(|send| (send, txn.handle.clone())));
        if let Some(((content, more, callback), handle)) = sent {
            return Step::Sent(callback, handle, content, more);
        }

        let finished = state
            .txn
            .as_ref()
            .map(|txn| matches!(txn.response, ResponseState::Finished))
            .unwrap_or(false);
        if finished {
            let txn = state.txn.take().unwrap();
            if txn.upgrade_requested {
                state.upgrade_protocol =
                    head::field_value(txn.fields.as_slice(), "Upgrade", 0);
            }
            return Step::End {
                callback: txn.callbacks.on_transaction_end.clone(),
                transaction: txn.handle,
                failed: false,
                keep_alive: txn.keep_alive,
                body: txn.body,
                upgrade_requested: txn.upgrade_requested,
            };
        }
    }

    // End of stream while a request is still incomplete.
    if state.eof {
        match state.phase {
            Phase::Head => {
                if 0 == state.read_buf.available() && state.write_buf.available() == 0 {
                    return Step::Close;
                }
                if state.read_buf.available() > 0 {
                    // A partial head can never complete.
                    return Step::Close;
                }
            }
            Phase::Transacting => {
                let body_pending = state
                    .txn
                    .as_ref()
                    .map(|txn| !txn.body.done())
                    .unwrap_or(false);
                if body_pending {
                    return fail_step(state);
                }
            }
            Phase::Drain => return Step::Close,
            Phase::Closing => (),
        }
    }

    // Interest bookkeeping.
    let mut desired = Ready::READ;
    if state.write_buf.available() > 0 {
        desired |= Ready::WRITE;
    }
    if desired != state.events {
        update_interest(conn, state, desired);
    }

    Step::Idle
}

fn advance_head(conn: &Arc<Conn>, state: &mut ConnState) -> Option<Step> {
    let head_len = match find_head(state.read_buf.unread()) {
        Some(head_len) => head_len,
        None => {
            if state.read_buf.available() > MAX_HEAD_SIZE {
                queue_reject(state);
            }
            return None;
        }
    };

    if head_len > MAX_HEAD_SIZE {
        queue_reject(state);
        return None;
    }

    let raw: Vec<u8> = state.read_buf.consume(head_len).to_vec();
    state.read_buf.compact();

    let head = match parse_head(&raw) {
        Ok(head) => head,
        Err(_) => {
            queue_reject(state);
            return None;
        }
    };

    let server = conn.server.upgrade()?;
    let id = server.next_transaction_id.fetch_add(1, Ordering::SeqCst) + 1;

    let callbacks = {
        let mut server_state = server.state.lock().unwrap();
        let callbacks = canonicalize(&head.target)
            .and_then(|target| server_state.path_callbacks.get(&target).cloned())
            .or_else(|| server_state.callbacks.clone());

        let callbacks = match callbacks {
            Some(callbacks) => callbacks,
            None => return None,
        };

        server_state
            .transactions
            .insert(id, Arc::downgrade(conn));
        callbacks
    };

    let handle = Transaction {
        conn: Arc::downgrade(conn),
        id,
        request_method: head.method,
        request_target: head.target,
        request_version: head.version,
        request_content_length: head.content_length,
    };

    trace!(conn.log, "transaction started";
           "id" => id,
           "method" => &handle.request_method,
           "target" => &handle.request_target);

    state.txn = Some(TxnState {
        handle: handle.clone(),
        fields: head.fields,
        callbacks: callbacks.clone(),
        keep_alive: head.keep_alive,
        body: BodyReader::of(head.content_length),
        recv: None,
        response: ResponseState::None,
        pending_send: None,
        upgrade_requested: false,
    });
    state.phase = Phase::Transacting;

    Some(Step::Start(callbacks.on_transaction_start, handle))
}

fn advance_body(_conn: &Arc<Conn>, state: &mut ConnState) -> Option<Step> {
    state.txn.as_ref()?.recv.as_ref()?;

    let failed = {
        let ConnState { read_buf, txn, .. } = &mut *state;
        let txn = txn.as_mut().unwrap();
        let (sink, goal, _) = txn.recv.as_mut().unwrap();
        let goal = *goal;

        let mut body_done = false;
        let result = match &mut txn.body {
            BodyReader::Done => {
                body_done = true;
                Ok(())
            }
            BodyReader::Length(remaining) => {
                let count = (*remaining)
                    .min(read_buf.available())
                    .min(goal.saturating_sub(sink.len()));
                if count > 0 {
                    let data = read_buf.consume(count);
                    let _ = sink.produce_from(data);
                    *remaining -= count;
                }
                body_done = 0 == *remaining;
                Ok(())
            }
            BodyReader::Chunked(decoder) => {
                let limit = goal.saturating_sub(sink.len());
                let result = decoder.decode(read_buf, sink, limit).map(|_| ());
                body_done = decoder.done();
                result
            }
        };

        if body_done {
            txn.body = BodyReader::Done;
        }
        read_buf.compact();
        result.is_err()
    };

    if failed {
        return Some(fail_step(state));
    }

    let txn = state.txn.as_mut().unwrap();
    let deliver = {
        let (sink, goal, _) = txn.recv.as_ref().unwrap();
        sink.len() >= *goal || txn.body.done()
    };
    if deliver {
        let (sink, _, callback) = txn.recv.take().unwrap();
        let more = txn.body.more();
        return Some(Step::Receive(callback, txn.handle.clone(), sink, more));
    }

    None
}

fn advance_drain(state: &mut ConnState) -> Option<Step> {
    let ConnState {
        read_buf, drain, ..
    } = state;
    let reader = drain.as_mut()?;

    let finished = match reader {
        BodyReader::Done => true,
        BodyReader::Length(remaining) => {
            let count = (*remaining).min(read_buf.available());
            read_buf.consume(count);
            *remaining -= count;
            0 == *remaining
        }
        BodyReader::Chunked(decoder) => {
            let mut discard = Buffer::new();
            if decoder.decode(read_buf, &mut discard, usize::MAX).is_err() {
                return Some(Step::Close);
            }
            decoder.done()
        }
    };
    read_buf.compact();

    if finished {
        state.drain = None;
        state.phase = Phase::Head;
    }
    None
}

/// Queues `400 Bad Request` and closes once it is flushed. No transaction
/// is created for an unparseable request.
fn queue_reject(state: &mut ConnState) {
    state
        .write_buf
        .append(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    state.close_after_flush = true;
    state.phase = Phase::Closing;
}

fn fail_step(state: &mut ConnState) -> Step {
    state.phase = Phase::Closing;

    match state.txn.take() {
        Some(txn) => Step::End {
            callback: txn.callbacks.on_transaction_end.clone(),
            transaction: txn.handle,
            failed: true,
            keep_alive: false,
            body: txn.body,
            upgrade_requested: txn.upgrade_requested,
        },
        None => Step::Close,
    }
}

fn fail_conn(conn: &Arc<Conn>) {
    let step = {
        let mut state = conn.state.lock().unwrap();
        if state.transport.is_none() {
            return;
        }
        fail_step(&mut state)
    };

    match step {
        Step::End {
            callback,
            transaction,
            ..
        } => {
            if let Some(server) = conn.server.upgrade() {
                let mut state = server.state.lock().unwrap();
                state.transactions.remove(&transaction.id);
            }
            if let Some(callback) = callback {
                callback(&transaction, true);
            }
            close_conn(conn);
        }
        _ => close_conn(conn),
    }
}

fn update_interest(conn: &Arc<Conn>, state: &mut ConnState, desired: Ready) {
    if let Some(event_loop) = conn.event_loop.upgrade() {
        if event_loop.modify(state.fd, desired).is_ok() {
            state.events = desired;
        }
    }
}

fn close_conn(conn: &Arc<Conn>) {
    let (fd, txn_id) = {
        let mut state = conn.state.lock().unwrap();
        if state.transport.is_none() {
            return;
        }

        let fd = state.fd;
        if let Some(event_loop) = conn.event_loop.upgrade() {
            let _ = event_loop.remove(fd);
        }
        if let Some(transport) = state.transport.take() {
            transport.shutdown();
        }

        state.phase = Phase::Closing;
        state.events = Ready::NONE;
        let txn_id = state.txn.take().map(|txn| txn.handle.id);
        (fd, txn_id)
    };

    trace!(conn.log, "closed"; "fd" => fd);

    if let Some(server) = conn.server.upgrade() {
        let mut state = server.state.lock().unwrap();
        state.connections.remove(&fd);
        if let Some(id) = txn_id {
            state.transactions.remove(&id);
        }
    }
}

impl Transaction {
    fn conn(&self) -> Arc<Conn> {
        self.conn
            .upgrade()
            .expect("transaction outlived its connection")
    }

    /// The `index`-th occurrence of request header `name`.
    pub fn request_value(&self, name: &str, index: usize) -> Option<String> {
        let conn = self.conn.upgrade()?;
        let state = conn.state.lock().unwrap();
        let txn = state.txn.as_ref()?;
        head::field_value(txn.fields.as_slice(), name, index)
    }

    /// Whether `value` appears as a token in the `delim`-separated request
    /// header `name`.
    pub fn contains_request_value(&self, name: &str, value: &str, delim: &str) -> bool {
        let conn = match self.conn.upgrade() {
            Some(conn) => conn,
            None => return false,
        };
        let state = conn.state.lock().unwrap();
        let txn = match state.txn.as_ref() {
            Some(txn) => txn,
            None => return false,
        };
        head::field_contains(txn.fields.as_slice(), name, value, delim)
    }

    /// Installs a streaming request body sink. The callback receives the
    /// filled buffer and the remaining count; zero means end of body.
    /// With chunked framing the count is 1 while more chunks may follow.
    /// An unbounded sink collects until the end of the body (or, for
    /// chunked bodies, the whole body); a bounded sink completes at its
    /// maximum and `receive` is called again for the next piece.
    pub fn receive<F>(&self, content: Buffer, callback: F)
    where
        F: FnOnce(&Transaction, Buffer, usize) + Send + 'static,
    {
        let conn = self.conn();
        {
            let mut state = conn.state.lock().unwrap();
            let txn = state.txn.as_mut().expect("transaction has ended");
            assert!(txn.recv.is_none(), "receive already pending");
            assert!(!txn.body.done(), "request body already received");

            let remaining = match txn.body {
                BodyReader::Length(remaining) => remaining,
                _ => usize::MAX,
            };
            let goal = content.len().saturating_add(content.headroom(remaining));
            txn.recv = Some((content, goal, Box::new(callback)));
        }
        pump(&conn);
    }

    /// Writes a status line and headers with a promised content length,
    /// to be followed by `send` calls streaming the body.
    pub fn respond_streamed(
        &self,
        status_code: StatusCode,
        reason: Option<&str>,
        header_fields: &[HeaderField],
        content_length: ContentLength,
    ) {
        let conn = self.conn();
        {
            let mut state = conn.state.lock().unwrap();
            let state = &mut *state;
            let txn = state.txn.as_mut().expect("transaction has ended");
            assert!(
                matches!(txn.response, ResponseState::None),
                "response already started"
            );

            write_head(
                &mut state.write_buf,
                status_code,
                reason,
                header_fields,
                Some(content_length),
            );

            txn.response = match content_length {
                ContentLength::Chunked => ResponseState::Streaming {
                    chunked: true,
                    remaining: 0,
                },
                ContentLength::Length(0) => ResponseState::Finished,
                ContentLength::Length(length) => ResponseState::Streaming {
                    chunked: false,
                    remaining: length,
                },
            };
        }

        self.enable_write(&conn);
        pump(&conn);
    }

    /// Single-shot response: writes the head and the whole body.
    pub fn respond(
        &self,
        status_code: StatusCode,
        header_fields: &[HeaderField],
        content: Option<Buffer>,
    ) {
        let conn = self.conn();
        {
            let mut state = conn.state.lock().unwrap();
            let state = &mut *state;
            let txn = state.txn.as_mut().expect("transaction has ended");
            assert!(
                matches!(txn.response, ResponseState::None),
                "response already started"
            );

            let body_length = content.as_ref().map(Buffer::len).unwrap_or(0);
            let framing = match status_code {
                StatusCode::SwitchingProtocols
                | StatusCode::Continue
                | StatusCode::EarlyHints
                | StatusCode::NoContent
                | StatusCode::NotModified => None,
                _ => Some(ContentLength::Length(body_length)),
            };

            write_head(&mut state.write_buf, status_code, None, header_fields, framing);
            if let Some(content) = content {
                state.write_buf.append(content.as_slice());
            }

            txn.response = ResponseState::Finished;
            if StatusCode::SwitchingProtocols == status_code {
                txn.upgrade_requested = true;
            }
        }

        self.enable_write(&conn);
        pump(&conn);
    }

    /// Streams one body chunk. The callback receives the drained buffer
    /// back together with the remaining count; queue the next chunk from
    /// it. With chunked framing an empty chunk terminates the body.
    pub fn send<F>(&self, content: Buffer, callback: F)
    where
        F: FnOnce(&Transaction, Buffer, usize) + Send + 'static,
    {
        let conn = self.conn();
        {
            let mut state = conn.state.lock().unwrap();
            let state = &mut *state;
            let txn = state.txn.as_mut().expect("transaction has ended");
            assert!(txn.pending_send.is_none(), "send already pending");

            let more = match &mut txn.response {
                ResponseState::Streaming { chunked: true, .. } => {
                    encode_chunk(&mut state.write_buf, content.as_slice());
                    match content.is_empty() {
                        true => {
                            txn.response = ResponseState::Finished;
                            0
                        }
                        false => 1,
                    }
                }
                ResponseState::Streaming {
                    chunked: false,
                    remaining,
                } => {
                    assert!(
                        content.len() <= *remaining,
                        "send exceeds the promised content length"
                    );
                    state.write_buf.append(content.as_slice());
                    *remaining -= content.len();
                    let more = *remaining;
                    if 0 == more {
                        txn.response = ResponseState::Finished;
                    }
                    more
                }
                _ => panic!("respond before send"),
            };

            txn.pending_send = Some((content, more, Box::new(callback)));
        }

        self.enable_write(&conn);
        pump(&conn);
    }

    /// Detaches the connection after a `101 Switching Protocols`
    /// response, transferring the transport to the caller. Valid from the
    /// end-of-transaction callback; no further transaction operations are
    /// permitted afterwards.
    pub fn upgraded(&self) -> Result<Upgrade> {
        let conn = self.conn();
        let mut state = conn.state.lock().unwrap();

        // Captured from the request fields when the 101 response flushed;
        // absent on any other transaction.
        let protocol = state
            .upgrade_protocol
            .take()
            .ok_or_else(|| Error::protocol("transaction was not upgraded"))?;

        let transport = state
            .transport
            .take()
            .ok_or_else(|| Error::protocol("connection already detached"))?;

        if let Some(event_loop) = conn.event_loop.upgrade() {
            let _ = event_loop.remove(state.fd);
        }
        state.detached = true;
        state.events = Ready::NONE;

        Ok(Upgrade {
            protocol,
            transport,
        })
    }

    fn enable_write(&self, conn: &Arc<Conn>) {
        let mut state = conn.state.lock().unwrap();
        let desired = state.events | Ready::WRITE;
        if let Some(event_loop) = conn.event_loop.upgrade() {
            if event_loop.modify(state.fd, desired).is_ok() {
                state.events = desired;
            }
        }
    }
}

fn write_head(
    out: &mut Buffer,
    status_code: StatusCode,
    reason: Option<&str>,
    header_fields: &[HeaderField],
    framing: Option<ContentLength>,
) {
    out.append(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status_code.code(),
            reason.unwrap_or_else(|| status_code.reason())
        )
        .as_bytes(),
    );

    let mut framed = false;
    for field in header_fields {
        framed |= field.name.eq_ignore_ascii_case("content-length")
            || field.name.eq_ignore_ascii_case("transfer-encoding");
        out.append(format!("{}: {}\r\n", field.name, field.value).as_bytes());
    }

    if !framed {
        match framing {
            Some(ContentLength::Length(length)) => {
                out.append(format!("Content-Length: {}\r\n", length).as_bytes());
            }
            Some(ContentLength::Chunked) => {
                out.append(b"Transfer-Encoding: chunked\r\n");
            }
            None => (),
        }
    }

    out.append(b"\r\n");
}
