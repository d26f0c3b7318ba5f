//! Non-blocking pump between one file descriptor and user-supplied sinks
//! and sources. Read interest is enabled exactly while a sink is
//! installed; write interest exactly while the write FIFO is non-empty.
//! All completion callbacks run on the event loop thread with no internal
//! lock held, so they may re-enter `read`/`write`/`close`.

use std::any::Any;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, Weak};

use crate::error::Result;
use crate::event_loop::{EventLoop, Ready};
use crate::io::sink::{AnySink, Sink};
use crate::io::source::{AnySource, Source};
use crate::logging::{self, trace, Logger};

const READ_CHUNK: usize = 16 * 1024;

pub type OnClose = Box<dyn FnMut(Option<io::Error>) + Send>;
type SinkCallback = Box<dyn FnOnce(Box<dyn Any + Send>) + Send>;
type SourceCallback = Box<dyn FnOnce(Box<dyn Any + Send>) + Send>;

struct WriteEntry {
    source: Box<dyn AnySource>,
    callback: Option<SourceCallback>,
}

struct Inner {
    log: Logger,
    event_loop: Weak<EventLoop>,
    stream: Option<Box<dyn Stream>>,
    fd: RawFd,
    events: Ready,
    read_sink: Option<Box<dyn AnySink>>,
    read_callback: Option<SinkCallback>,
    write_queue: VecDeque<WriteEntry>,
    on_close: Option<OnClose>,
}

/// What `FdIo` pumps over: any non-blocking read/write object exposing
/// its fd for readiness registration.
pub trait Stream: Read + Write + AsRawFd + Send {}

impl<T> Stream for T where T: Read + Write + AsRawFd + Send {}

pub struct FdIo {
    inner: Arc<Mutex<Inner>>,
}

impl FdIo {
    pub fn new<'a, L>(event_loop: Weak<EventLoop>, log: L) -> FdIo
    where
        L: Into<Option<&'a Logger>>,
    {
        FdIo {
            inner: Arc::new(Mutex::new(Inner {
                log: logging::child(log, "fdio"),
                event_loop,
                stream: None,
                fd: -1,
                events: Ready::NONE,
                read_sink: None,
                read_callback: None,
                write_queue: VecDeque::new(),
                on_close: None,
            })),
        }
    }

    /// Invoked exactly once when the fd closes: `None` for a clean end of
    /// stream, the error otherwise. Not invoked by an explicit `close`.
    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: FnMut(Option<io::Error>) + Send + 'static,
    {
        self.inner.lock().unwrap().on_close = Some(Box::new(callback));
    }

    /// Takes ownership of a non-blocking stream and registers it with the
    /// event loop. An already open `FdIo` is closed first.
    pub fn open<S>(&self, stream: S) -> Result<()>
    where
        S: Read + Write + AsRawFd + Send + 'static,
    {
        self.close();

        let fd = stream.as_raw_fd();
        let event_loop = {
            let inner = self.inner.lock().unwrap();
            inner.event_loop.upgrade().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "event loop has gone away")
            })?
        };

        let pump = self.inner.clone();
        event_loop.add(fd, Ready::NONE, move |_, ready| {
            on_event(&pump, ready);
            Ok(())
        })?;

        let mut inner = self.inner.lock().unwrap();
        trace!(inner.log, "opened"; "fd" => fd);
        inner.stream = Some(Box::new(stream));
        inner.fd = fd;
        inner.events = Ready::NONE;
        Ok(())
    }

    /// Installs a read sink. The completion callback receives the sink
    /// back once it is full; a clean end of stream first completes the
    /// pending sink with whatever was received, then fires the close
    /// callback.
    pub fn read<S, F>(&self, sink: S, callback: F)
    where
        S: Sink + Send + 'static,
        F: FnOnce(S) + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        assert!(inner.read_sink.is_none(), "read already pending");

        inner.read_sink = Some(Box::new(sink));
        inner.read_callback = Some(Box::new(move |sink: Box<dyn Any + Send>| {
            let sink = sink.downcast::<S>().expect("sink type");
            callback(*sink);
        }));

        // Re-register even when read interest is already set; the fresh
        // edge covers bytes that arrived while no sink was installed.
        let events = inner.events | Ready::READ;
        update_events(&mut inner, events, true);
    }

    /// Appends a source to the write FIFO. The completion callback
    /// receives the drained source back.
    pub fn write<S, F>(&self, source: S, callback: F)
    where
        S: Source + Send + 'static,
        F: FnOnce(S) + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap();

        inner.write_queue.push_back(WriteEntry {
            source: Box::new(source),
            callback: Some(Box::new(move |source: Box<dyn Any + Send>| {
                let source = source.downcast::<S>().expect("source type");
                callback(*source);
            })),
        });

        if !inner.events.is_writable() {
            let events = inner.events | Ready::WRITE;
            update_events(&mut inner, events, false);
        }
    }

    /// Fire-and-forget write.
    pub fn write_all<S>(&self, source: S)
    where
        S: Source + Send + 'static,
    {
        self.write(source, |_source: S| {});
    }

    /// Idempotent. Cancels queued reads and writes without invoking their
    /// completion handlers and closes the fd.
    pub fn close(&self) {
        close_inner(&self.inner);
    }

    pub fn fd(&self) -> RawFd {
        self.inner.lock().unwrap().fd
    }
}

impl Drop for FdIo {
    fn drop(&mut self) {
        self.close();
    }
}

fn update_events(inner: &mut Inner, events: Ready, force: bool) {
    if events == inner.events && !force {
        return;
    }

    if let Some(event_loop) = inner.event_loop.upgrade() {
        if event_loop.modify(inner.fd, events).is_ok() {
            inner.events = events;
        }
    }
}

fn on_event(inner: &Arc<Mutex<Inner>>, ready: Ready) {
    if ready.is_readable() {
        pump_read(inner);
    }
    if ready.is_writable() {
        pump_write(inner);
    }
    if ready.is_error() {
        let error = {
            let guard = inner.lock().unwrap();
            match guard.stream.is_some() {
                true => Some(io::Error::new(io::ErrorKind::ConnectionReset, "socket error")),
                false => None,
            }
        };
        if error.is_some() {
            close_with(inner, error);
        }
    } else if ready.is_hup() {
        // Hangup with no pending data left; the read pump above saw the
        // end of stream if a sink was installed.
        close_with(inner, None);
    }
}

fn pump_read(inner: &Arc<Mutex<Inner>>) {
    loop {
        let mut guard = inner.lock().unwrap();

        if guard.read_sink.is_none() || guard.stream.is_none() {
            return;
        }

        let Inner {
            read_sink, stream, ..
        } = &mut *guard;
        let sink = read_sink.as_mut().unwrap();
        let stream = stream.as_mut().unwrap();

        let headroom = sink.headroom(READ_CHUNK);
        if 0 == headroom {
            complete_read(guard);
            return;
        }

        let before = sink.size();
        let data = match sink.produce(headroom) {
            Ok(data) => data,
            Err(_) => {
                drop(guard);
                close_with(inner, Some(io::Error::new(io::ErrorKind::OutOfMemory, "sink resize failed")));
                return;
            }
        };

        match stream.read(data) {
            Err(err) if io::ErrorKind::WouldBlock == err.kind() => {
                let _ = sink.resize(before);
                return;
            }
            Err(err) if io::ErrorKind::Interrupted == err.kind() => {
                let _ = sink.resize(before);
            }
            Err(err) => {
                let _ = sink.resize(before);
                drop(guard);
                close_with(inner, Some(err));
                return;
            }
            Ok(0) => {
                let _ = sink.resize(before);
                complete_read(guard);
                close_with(inner, None);
                return;
            }
            Ok(count) => {
                let _ = sink.resize(before + count);
                if sink.full() {
                    complete_read(guard);
                    return;
                }
            }
        }
    }
}

fn complete_read(mut guard: std::sync::MutexGuard<'_, Inner>) {
    let events = guard.events.without(Ready::READ);
    update_events(&mut guard, events, false);

    let sink = guard.read_sink.take();
    let callback = guard.read_callback.take();
    drop(guard);

    if let (Some(sink), Some(callback)) = (sink, callback) {
        callback(sink.into_any());
    }
}

fn pump_write(inner: &Arc<Mutex<Inner>>) {
    loop {
        let mut guard = inner.lock().unwrap();

        if guard.stream.is_none() {
            return;
        }
        if guard.write_queue.is_empty() {
            return;
        }

        let Inner {
            write_queue, stream, ..
        } = &mut *guard;
        let entry = write_queue.front_mut().unwrap();
        let stream = stream.as_mut().unwrap();

        if !entry.source.empty() {
            let available = entry.source.available();
            match stream.write(entry.source.peek(available)) {
                Err(err) if io::ErrorKind::WouldBlock == err.kind() => return,
                Err(err) if io::ErrorKind::Interrupted == err.kind() => continue,
                Err(err) => {
                    drop(guard);
                    close_with(inner, Some(err));
                    return;
                }
                Ok(count) => {
                    entry.source.advance(count);
                }
            }
        }

        if entry.source.empty() {
            let mut entry = write_queue.pop_front().unwrap();
            if write_queue.is_empty() {
                let events = guard.events.without(Ready::WRITE);
                update_events(&mut guard, events, false);
            }
            drop(guard);

            if let Some(callback) = entry.callback.take() {
                callback(entry.source.into_any());
            }
        }
    }
}

fn close_with(inner: &Arc<Mutex<Inner>>, error: Option<io::Error>) {
    let callback = {
        let mut guard = inner.lock().unwrap();
        if guard.stream.is_none() {
            return;
        }
        trace!(guard.log, "closing"; "fd" => guard.fd, "error" => ?error);
        guard.on_close.take()
    };

    if let Some(mut callback) = callback {
        callback(error);
    }

    close_inner(inner);
}

fn close_inner(inner: &Arc<Mutex<Inner>>) {
    let mut guard = inner.lock().unwrap();
    if guard.stream.is_none() {
        return;
    }

    if let Some(event_loop) = guard.event_loop.upgrade() {
        let _ = event_loop.remove(guard.fd);
    }

    guard.stream = None;
    guard.fd = -1;
    guard.events = Ready::NONE;
    guard.read_sink = None;
    guard.read_callback = None;
    guard.write_queue.clear();
}
