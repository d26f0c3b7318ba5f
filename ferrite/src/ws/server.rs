//! Per-socket WebSocket state machines. Each socket owns the upgraded
//! transport, reassembles inbound frames into whole messages, and drains
//! a mutex-guarded send FIFO on the event loop thread: `send`, `ping`
//! and `close` are safe from any thread and hop onto the loop through
//! the socket's send timer, one frame per wake.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use indexmap::IndexMap;

use crate::error::Result;
use crate::event_loop::{EventLoop, Ready};
use crate::http::Upgrade;
use crate::io::buffer::Buffer;
use crate::io::source::Source;
use crate::io::transport::Transport;
use crate::logging::{self, debug, trace, Logger};
use crate::timer::Timer;
use crate::ws::frame::{self, Opcode};
use crate::ws::{Message, State, CLOSE_ABNORMAL, CLOSE_NO_STATUS, CLOSE_PROTOCOL_ERROR};

const READ_CHUNK: usize = 16 * 1024;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_MAX_RECEIVE_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
const DEFAULT_FRAGMENT_MESSAGE_THRESHOLD: usize = 1024 * 1024;
const MAX_CONTROL_PAYLOAD: usize = 125;

pub type MessageCallback = Box<dyn FnMut(&Socket, Message) + Send>;
pub type PongCallback = Box<dyn FnMut(&Socket) + Send>;
pub type ErrorCallback = Box<dyn FnMut(&Socket) + Send>;
pub type CloseCallback = Box<dyn FnMut(&Socket, bool, u16, &[u8]) + Send>;

#[derive(Default)]
struct Callbacks {
    on_message: Option<MessageCallback>,
    on_pong: Option<PongCallback>,
    on_error: Option<ErrorCallback>,
    on_close: Option<CloseCallback>,
}

struct OutFrame {
    opcode: Opcode,
    fin: bool,
    payload: Vec<u8>,
}

#[derive(Default)]
struct SendQueue {
    frames: VecDeque<OutFrame>,
    close_queued: bool,
}

struct SocketIo {
    transport: Option<Transport>,
    fd: RawFd,
    events: Ready,
    state: State,
    read_buf: Buffer,
    write_buf: Buffer,
    in_flight: Option<Opcode>,
    fragments: Vec<Vec<u8>>,
    fragments_opcode: Opcode,
    fragments_size: usize,
    close_code: u16,
    close_reason: Vec<u8>,
    close_sent: bool,
    close_received: bool,
    error_close: bool,
    eof: bool,
}

pub struct Socket {
    pub id: u64,
    log: Logger,
    event_loop: Weak<EventLoop>,
    io: Mutex<SocketIo>,
    send_queue: Mutex<SendQueue>,
    callbacks: Mutex<Callbacks>,
    send_timer: Timer,
    ping_timer: Timer,
    max_receive_message_size: AtomicUsize,
    fragment_message_threshold: AtomicUsize,
}

struct ServerInner {
    log: Logger,
    event_loop: Weak<EventLoop>,
    next_socket_id: AtomicU64,
    sockets: Mutex<IndexMap<u64, Arc<Socket>>>,
    sweeper: Mutex<Option<Timer>>,
}

/// Owns the sockets created from HTTP upgrades and sweeps away the ones
/// that reached `Closed`.
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new<'a, L>(log: L, event_loop: Weak<EventLoop>) -> Server
    where
        L: Into<Option<&'a Logger>>,
    {
        Server {
            inner: Arc::new(ServerInner {
                log: logging::child(log, "ws"),
                event_loop,
                next_socket_id: AtomicU64::new(0),
                sockets: Mutex::new(IndexMap::new()),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Arms the maintenance timer that releases closed sockets.
    pub fn start(&self) {
        let server = Arc::downgrade(&self.inner);
        let sweeper = Timer::new(self.inner.event_loop.clone(), move || {
            if let Some(server) = server.upgrade() {
                sweep(&server);
            }
        });
        sweeper.set(SWEEP_INTERVAL, Some(SWEEP_INTERVAL));

        *self.inner.sweeper.lock().unwrap() = Some(sweeper);
    }

    pub fn stop(&self) {
        *self.inner.sweeper.lock().unwrap() = None;

        let sockets: Vec<Arc<Socket>> = {
            let sockets = self.inner.sockets.lock().unwrap();
            sockets.values().cloned().collect()
        };
        for socket in sockets {
            finalize(&socket, true);
        }
        self.inner.sockets.lock().unwrap().clear();
    }

    /// Takes ownership of an upgraded connection and starts frame I/O on
    /// it. The returned socket is `Open`.
    pub fn add(&self, upgrade: Upgrade) -> Result<Arc<Socket>> {
        debug_assert!(upgrade.protocol.eq_ignore_ascii_case("websocket"));

        let event_loop = self.inner.event_loop.upgrade().ok_or_else(|| {
            crate::error::Error::resource("event loop has gone away")
        })?;

        let id = self.inner.next_socket_id.fetch_add(1, Ordering::SeqCst) + 1;
        let fd = upgrade.transport.fd();

        let socket = Arc::new_cyclic(|weak: &Weak<Socket>| {
            let sender = weak.clone();
            let send_timer = Timer::new(self.inner.event_loop.clone(), move || {
                if let Some(socket) = sender.upgrade() {
                    pump_send(&socket);
                }
            });

            let pinger = weak.clone();
            let ping_timer = Timer::new(self.inner.event_loop.clone(), move || {
                if let Some(socket) = pinger.upgrade() {
                    socket.ping();
                }
            });

            Socket {
                id,
                log: self.inner.log.new(crate::logging::o!("socket" => id)),
                event_loop: self.inner.event_loop.clone(),
                io: Mutex::new(SocketIo {
                    transport: Some(upgrade.transport),
                    fd,
                    events: Ready::READ,
                    state: State::Open,
                    read_buf: Buffer::new(),
                    write_buf: Buffer::new(),
                    in_flight: None,
                    fragments: Vec::new(),
                    fragments_opcode: Opcode::Binary,
                    fragments_size: 0,
                    close_code: CLOSE_NO_STATUS,
                    close_reason: Vec::new(),
                    close_sent: false,
                    close_received: false,
                    error_close: false,
                    eof: false,
                }),
                send_queue: Mutex::new(SendQueue::default()),
                callbacks: Mutex::new(Callbacks::default()),
                send_timer,
                ping_timer,
                max_receive_message_size: AtomicUsize::new(DEFAULT_MAX_RECEIVE_MESSAGE_SIZE),
                fragment_message_threshold: AtomicUsize::new(DEFAULT_FRAGMENT_MESSAGE_THRESHOLD),
            }
        });

        let handler = socket.clone();
        event_loop.add(fd, Ready::READ, move |_, ready| {
            on_socket_event(&handler, ready);
            Ok(())
        })?;

        debug!(self.inner.log, "socket added"; "socket" => id, "fd" => fd);

        let mut sockets = self.inner.sockets.lock().unwrap();
        sockets.insert(id, socket.clone());
        Ok(socket)
    }

    pub fn socket(&self, id: u64) -> Option<Arc<Socket>> {
        self.inner.sockets.lock().unwrap().get(&id).cloned()
    }

    /// Closes and releases one socket immediately.
    pub fn remove(&self, id: u64) {
        let socket = {
            let mut sockets = self.inner.sockets.lock().unwrap();
            sockets.shift_remove(&id)
        };
        if let Some(socket) = socket {
            finalize(&socket, true);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sweep(server: &Arc<ServerInner>) {
    let mut sockets = server.sockets.lock().unwrap();
    sockets.retain(|id, socket| {
        let closed = State::Closed == socket.io.lock().unwrap().state;
        if closed {
            trace!(server.log, "sweeping closed socket"; "socket" => *id);
        }
        !closed
    });
}

impl Socket {
    pub fn state(&self) -> State {
        self.io.lock().unwrap().state
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        let io = self.io.lock().unwrap();
        io.transport.as_ref().and_then(|t| t.peer_addr().ok())
    }

    pub fn set_no_delay(&self, enable: bool) {
        let io = self.io.lock().unwrap();
        if let Some(transport) = io.transport.as_ref() {
            let _ = transport.set_nodelay(enable);
        }
    }

    /// Sends a Ping at every `interval`; `None` stops the keepalive.
    /// Liveness is reported through the pong callback; no implicit close
    /// happens on a missing pong.
    pub fn set_ping_interval(&self, interval: Option<Duration>) {
        match interval {
            Some(interval) => self.ping_timer.set(interval, Some(interval)),
            None => self.ping_timer.clear(),
        };
    }

    /// Ceiling on the reassembled size of one inbound message, counting
    /// all continuation fragments.
    pub fn set_max_receive_message_size(&self, size: usize) {
        self.max_receive_message_size.store(size, Ordering::SeqCst);
    }

    /// Outbound messages at least this large are split into continuation
    /// frames of at most this size.
    pub fn set_fragment_message_threshold(&self, size: usize) {
        assert!(size > 0);
        self.fragment_message_threshold.store(size, Ordering::SeqCst);
    }

    pub fn set_message_callback<F>(&self, callback: F)
    where
        F: FnMut(&Socket, Message) + Send + 'static,
    {
        self.callbacks.lock().unwrap().on_message = Some(Box::new(callback));
    }

    pub fn set_pong_callback<F>(&self, callback: F)
    where
        F: FnMut(&Socket) + Send + 'static,
    {
        self.callbacks.lock().unwrap().on_pong = Some(Box::new(callback));
    }

    pub fn set_error_callback<F>(&self, callback: F)
    where
        F: FnMut(&Socket) + Send + 'static,
    {
        self.callbacks.lock().unwrap().on_error = Some(Box::new(callback));
    }

    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: FnMut(&Socket, bool, u16, &[u8]) + Send + 'static,
    {
        self.callbacks.lock().unwrap().on_close = Some(Box::new(callback));
    }

    /// Enqueues a Ping control frame. Safe from any thread.
    pub fn ping(&self) {
        self.enqueue_control(Opcode::Ping, Vec::new());
    }

    /// Enqueues a whole message, fragmenting it when it reaches the
    /// fragment threshold. Safe from any thread; per-socket enqueue order
    /// is preserved on the wire.
    pub fn send(&self, message: Message) {
        let threshold = self.fragment_message_threshold.load(Ordering::SeqCst);

        let (opcode, payload) = match message {
            Message::Text(text) => (Opcode::Text, text.into_bytes()),
            Message::Binary(data) => (Opcode::Binary, data.into_vec()),
        };

        {
            let mut queue = self.send_queue.lock().unwrap();
            if queue.close_queued {
                return;
            }
            queue.frames.extend(fragment(opcode, payload, threshold));
        }

        self.restart();
    }

    /// Enqueues a Close frame. `CLOSE_NO_STATUS` sends an empty payload;
    /// any other code is encoded before the reason bytes. Safe from any
    /// thread.
    pub fn close(&self, code: u16, reason: &[u8]) {
        let mut payload = Vec::new();
        if CLOSE_NO_STATUS != code {
            let mut encoded = [0u8; 2];
            BigEndian::write_u16(&mut encoded, code);
            payload.extend_from_slice(&encoded);
            payload.extend_from_slice(reason);
        } else {
            debug_assert!(reason.is_empty());
        }

        self.enqueue_close(payload);
    }

    fn enqueue_control(&self, opcode: Opcode, payload: Vec<u8>) {
        debug_assert!(payload.len() <= MAX_CONTROL_PAYLOAD);

        {
            let mut queue = self.send_queue.lock().unwrap();
            if queue.close_queued {
                return;
            }
            queue.frames.push_back(OutFrame {
                opcode,
                fin: true,
                payload,
            });
        }
        self.restart();
    }

    fn enqueue_close(&self, payload: Vec<u8>) {
        {
            let mut queue = self.send_queue.lock().unwrap();
            if queue.close_queued {
                return;
            }
            queue.close_queued = true;
            queue.frames.push_back(OutFrame {
                opcode: Opcode::Close,
                fin: true,
                payload,
            });
        }
        self.restart();
    }

    /// Wakes the event loop to drain the send FIFO.
    fn restart(&self) {
        self.send_timer.set(Duration::from_secs(0), None);
    }
}

fn on_socket_event(socket: &Arc<Socket>, ready: Ready) {
    if ready.is_error() {
        finalize(socket, false);
        return;
    }

    if ready.is_hup() {
        socket.io.lock().unwrap().eof = true;
    }

    if ready.is_readable() || ready.is_hup() {
        pump_recv(socket);
    }
    if ready.is_writable() {
        pump_send(socket);
    }
}

/// What one parsed frame asks of the socket, decided under the io lock
/// and executed after it is released.
enum Action {
    Nothing,
    Deliver(Message),
    Pong,
    PongReply(Vec<u8>),
    CloseFrame,
    ProtocolError(&'static str),
    Abort,
}

fn pump_recv(socket: &Arc<Socket>) {
    loop {
        let action = {
            let mut io = socket.io.lock().unwrap();
            if io.transport.is_none() {
                return;
            }

            // Ingress.
            let mut chunk = [0u8; READ_CHUNK];
            let mut failed = false;
            while !io.eof {
                let result = io.transport.as_mut().unwrap().read(&mut chunk);
                match result {
                    Err(err) if std::io::ErrorKind::WouldBlock == err.kind() => break,
                    Err(err) if std::io::ErrorKind::Interrupted == err.kind() => continue,
                    Err(_) => {
                        failed = true;
                        break;
                    }
                    Ok(0) => {
                        io.eof = true;
                    }
                    Ok(count) => {
                        io.read_buf.append(&chunk[..count]);
                    }
                }
            }
            if failed {
                drop(io);
                finalize(socket, false);
                return;
            }

            match next_frame(socket, &mut io) {
                NextFrame::Wait => {
                    if io.eof && State::Closed != io.state {
                        // The peer vanished without a close handshake.
                        drop(io);
                        finalize(socket, false);
                    }
                    return;
                }
                NextFrame::Act(action) => action,
            }
        };

        match action {
            Action::Nothing => (),
            Action::Deliver(message) => {
                let callback = socket.callbacks.lock().unwrap().on_message.take();
                if let Some(mut callback) = callback {
                    callback(socket, message);
                    restore_message_callback(socket, callback);
                }
            }
            Action::Pong => {
                let callback = socket.callbacks.lock().unwrap().on_pong.take();
                if let Some(mut callback) = callback {
                    callback(socket);
                    let mut callbacks = socket.callbacks.lock().unwrap();
                    if callbacks.on_pong.is_none() {
                        callbacks.on_pong = Some(callback);
                    }
                }
            }
            Action::PongReply(payload) => {
                socket.enqueue_control(Opcode::Pong, payload);
            }
            Action::CloseFrame => {
                let (echo, finish) = {
                    let io = socket.io.lock().unwrap();
                    (
                        !io.close_sent,
                        io.close_sent,
                    )
                };

                if echo {
                    // Echo the peer's code back.
                    let (code, reason) = {
                        let io = socket.io.lock().unwrap();
                        (io.close_code, io.close_reason.clone())
                    };
                    match code {
                        CLOSE_NO_STATUS => socket.close(CLOSE_NO_STATUS, b""),
                        code => socket.close(code, &reason),
                    }
                }
                if finish {
                    finalize(socket, true);
                    return;
                }
            }
            Action::ProtocolError(reason) => {
                protocol_error(socket, reason);
                return;
            }
            Action::Abort => {
                finalize(socket, false);
                return;
            }
        }
    }
}

enum NextFrame {
    Wait,
    Act(Action),
}

fn next_frame(socket: &Arc<Socket>, io: &mut SocketIo) -> NextFrame {
    let header = match frame::parse_header(io.read_buf.unread()) {
        Err(_) => return NextFrame::Act(Action::ProtocolError("malformed frame header")),
        Ok(None) => return NextFrame::Wait,
        Ok(Some(header)) => header,
    };

    let opcode = match Opcode::of(header.opcode) {
        Some(opcode) => opcode,
        // Unknown opcodes abort the connection outright.
        None => return NextFrame::Act(Action::Abort),
    };

    let maximum = socket.max_receive_message_size.load(Ordering::SeqCst);
    if opcode.is_control() {
        if !header.fin {
            return NextFrame::Act(Action::ProtocolError("fragmented control frame"));
        }
        if header.length > MAX_CONTROL_PAYLOAD {
            return NextFrame::Act(Action::ProtocolError("oversize control frame"));
        }
    } else if io.fragments_size + header.length > maximum {
        return NextFrame::Act(Action::ProtocolError("message exceeds receive ceiling"));
    }

    let total = header.header_length + header.length;
    if io.read_buf.available() < total {
        return NextFrame::Wait;
    }

    io.read_buf.consume(header.header_length);
    let mut payload = io.read_buf.consume(header.length).to_vec();
    io.read_buf.compact();

    if let Some(mask) = header.mask {
        frame::unmask(&mut payload, mask);
    }

    trace!(socket.log, "frame received";
           "opcode" => opcode.as_str(),
           "fin" => header.fin,
           "length" => header.length);

    NextFrame::Act(handle_frame(io, opcode, header.fin, payload))
}

fn handle_frame(io: &mut SocketIo, opcode: Opcode, fin: bool, payload: Vec<u8>) -> Action {
    match opcode {
        Opcode::Continuation => {
            if io.fragments.is_empty() {
                return Action::ProtocolError("continuation without a message");
            }

            io.fragments_size += payload.len();
            io.fragments.push(payload);

            match fin {
                true => assemble(io),
                false => Action::Nothing,
            }
        }
        Opcode::Text | Opcode::Binary => {
            if !io.fragments.is_empty() {
                return Action::ProtocolError("data frame inside a fragmented message");
            }

            io.fragments_opcode = opcode;
            io.fragments_size = payload.len();
            io.fragments.push(payload);

            match fin {
                true => assemble(io),
                false => Action::Nothing,
            }
        }
        Opcode::Ping => Action::PongReply(payload),
        Opcode::Pong => Action::Pong,
        Opcode::Close => {
            io.close_received = true;
            if payload.len() >= 2 {
                io.close_code = BigEndian::read_u16(&payload[..2]);
                io.close_reason = payload[2..].to_vec();
            }
            if State::Open == io.state {
                io.state = State::Closing;
            }
            // A close mid-message discards the partial fragments.
            io.fragments.clear();
            io.fragments_size = 0;

            Action::CloseFrame
        }
    }
}

fn assemble(io: &mut SocketIo) -> Action {
    let fragments = std::mem::take(&mut io.fragments);
    io.fragments_size = 0;

    let mut payload = Vec::new();
    match fragments.len() {
        1 => payload = fragments.into_iter().next().unwrap(),
        _ => {
            for fragment in fragments {
                payload.extend_from_slice(&fragment);
            }
        }
    }

    // Data received while the socket is closing is dropped.
    if State::Open != io.state {
        return Action::Nothing;
    }

    match io.fragments_opcode {
        Opcode::Text => match String::from_utf8(payload) {
            Ok(text) => Action::Deliver(Message::Text(text)),
            Err(_) => Action::ProtocolError("text message is not valid UTF-8"),
        },
        _ => Action::Deliver(Message::Binary(Buffer::from(payload))),
    }
}

fn restore_message_callback(socket: &Arc<Socket>, callback: MessageCallback) {
    let mut callbacks = socket.callbacks.lock().unwrap();
    if callbacks.on_message.is_none() {
        callbacks.on_message = Some(callback);
    }
}

/// Closes the conversation after a protocol violation: a Close frame with
/// code 1002 where the transport still works, reported as unclean.
fn protocol_error(socket: &Arc<Socket>, reason: &'static str) {
    debug!(socket.log, "protocol error"; "reason" => reason);

    {
        let mut io = socket.io.lock().unwrap();
        if State::Closed == io.state {
            return;
        }
        io.error_close = true;
        io.state = State::Closing;
        io.close_code = CLOSE_PROTOCOL_ERROR;
        io.close_reason = reason.as_bytes().to_vec();
        io.fragments.clear();
        io.fragments_size = 0;
    }

    socket.close(CLOSE_PROTOCOL_ERROR, reason.as_bytes());
}

fn pump_send(socket: &Arc<Socket>) {
    let finish = {
        let mut io = socket.io.lock().unwrap();
        if io.transport.is_none() {
            return;
        }

        // Stage the next frame when the wire buffer is idle.
        if 0 == io.write_buf.available() {
            let frame = {
                let mut queue = socket.send_queue.lock().unwrap();
                queue.frames.pop_front()
            };

            match frame {
                None => {
                    let events = io.events.without(Ready::WRITE);
                    update_interest(socket, &mut io, events);
                    return;
                }
                Some(frame) => {
                    let SocketIo { write_buf, .. } = &mut *io;
                    frame::write_header(write_buf, frame.fin, frame.opcode, frame.payload.len());
                    write_buf.append(&frame.payload);
                    io.in_flight = Some(frame.opcode);

                    trace!(socket.log, "frame staged";
                           "opcode" => frame.opcode.as_str(),
                           "fin" => frame.fin,
                           "length" => frame.payload.len());
                }
            }
        }

        // Egress.
        let mut failed = false;
        loop {
            let available = io.write_buf.available();
            if 0 == available {
                break;
            }

            let result = {
                let SocketIo {
                    transport,
                    write_buf,
                    ..
                } = &mut *io;
                transport.as_mut().unwrap().write(write_buf.peek(available))
            };
            match result {
                Err(err) if std::io::ErrorKind::WouldBlock == err.kind() => break,
                Err(err) if std::io::ErrorKind::Interrupted == err.kind() => continue,
                Err(_) => {
                    failed = true;
                    break;
                }
                Ok(count) => {
                    io.write_buf.advance(count);
                }
            }
        }
        if failed {
            drop(io);
            finalize(socket, false);
            return;
        }
        io.write_buf.compact();

        if io.write_buf.available() > 0 {
            // Backpressure: wait for writability.
            let events = io.events | Ready::WRITE;
            update_interest(socket, &mut io, events);
            return;
        }

        // Frame fully on the wire.
        let mut finish = None;
        if let Some(opcode) = io.in_flight.take() {
            if Opcode::Close == opcode {
                io.close_sent = true;
                if io.close_received {
                    finish = Some(!io.error_close);
                } else if io.error_close {
                    finish = Some(false);
                } else {
                    io.state = State::Closing;
                }
            }
        }

        if finish.is_none() {
            let more = !socket.send_queue.lock().unwrap().frames.is_empty();
            if more {
                // One frame per wake; ask for the next one.
                socket.restart();
            } else {
                let events = io.events.without(Ready::WRITE);
                update_interest(socket, &mut io, events);
            }
        }
        finish
    };

    if let Some(clean) = finish {
        finalize(socket, clean);
    }
}

/// Splits an outbound message into frames: below the threshold a single
/// frame with FIN, otherwise continuation frames of at most `threshold`
/// bytes with FIN only on the last.
fn fragment(opcode: Opcode, payload: Vec<u8>, threshold: usize) -> Vec<OutFrame> {
    if payload.len() < threshold {
        return vec![OutFrame {
            opcode,
            fin: true,
            payload,
        }];
    }

    let mut frames = Vec::with_capacity(payload.len() / threshold + 1);
    let mut opcode = opcode;
    let mut offset = 0;

    while offset < payload.len() {
        let end = (offset + threshold).min(payload.len());
        frames.push(OutFrame {
            opcode,
            fin: end == payload.len(),
            payload: payload[offset..end].to_vec(),
        });
        opcode = Opcode::Continuation;
        offset = end;
    }
    frames
}

fn update_interest(socket: &Arc<Socket>, io: &mut SocketIo, desired: Ready) {
    if desired == io.events {
        return;
    }
    if let Some(event_loop) = socket.event_loop.upgrade() {
        if event_loop.modify(io.fd, desired).is_ok() {
            io.events = desired;
        }
    }
}

/// Tears the socket down exactly once and reports the close. An unclean
/// close first fires the error callback and reports code 1006 unless a
/// specific code was already recorded.
fn finalize(socket: &Arc<Socket>, clean: bool) {
    let (code, reason) = {
        let mut io = socket.io.lock().unwrap();
        if State::Closed == io.state {
            return;
        }

        if let Some(event_loop) = socket.event_loop.upgrade() {
            let _ = event_loop.remove(io.fd);
        }
        if let Some(transport) = io.transport.take() {
            transport.shutdown();
        }

        io.state = State::Closed;

        if !clean && !io.error_close {
            io.close_code = CLOSE_ABNORMAL;
            io.close_reason.clear();
        }
        (io.close_code, io.close_reason.clone())
    };

    socket.ping_timer.clear();
    socket.send_timer.clear();

    debug!(socket.log, "socket closed"; "clean" => clean, "code" => code);

    if !clean {
        let callback = socket.callbacks.lock().unwrap().on_error.take();
        if let Some(mut callback) = callback {
            callback(socket);
        }
    }

    let callback = socket.callbacks.lock().unwrap().on_close.take();
    if let Some(mut callback) = callback {
        callback(socket, clean, code, &reason);
    }
}
