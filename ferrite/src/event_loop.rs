//! Readiness multiplexer. One `EventLoop` owns a set of
//! (fd, interest, callback) registrations and dispatches one ready event
//! per step on the thread that calls [`EventLoop::dispatch`]. Any thread
//! may interrupt a dispatch in progress or arm timers; everything else
//! happens on the dispatch thread.

use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use mio::unix::SourceFd;
use mio::{Events, Poll, Registry, Token, Waker};

use crate::error::Result;
use crate::logging::{self, trace, Logger};

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Readiness interest and delivery mask.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Ready(u8);

impl Ready {
    pub const NONE: Ready = Ready(0);
    pub const READ: Ready = Ready(1);
    pub const WRITE: Ready = Ready(2);
    pub const ERROR: Ready = Ready(4);
    pub const HUP: Ready = Ready(8);

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_readable(self) -> bool {
        self.0 & Ready::READ.0 != 0
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.0 & Ready::WRITE.0 != 0
    }

    #[inline]
    pub fn is_error(self) -> bool {
        self.0 & Ready::ERROR.0 != 0
    }

    #[inline]
    pub fn is_hup(self) -> bool {
        self.0 & Ready::HUP.0 != 0
    }

    #[inline]
    pub fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }

    /// This readiness with the bits of `other` stripped.
    #[inline]
    pub fn without(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }
}

impl BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    #[inline]
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Ready {
    type Output = Ready;

    #[inline]
    fn bitand(self, rhs: Ready) -> Ready {
        Ready(self.0 & rhs.0)
    }
}

pub type IoCallback = Arc<dyn Fn(RawFd, Ready) -> Result<()> + Send + Sync>;

struct Registration {
    interest: Ready,
    callback: IoCallback,
}

pub(crate) struct TimerEntry {
    deadline: Option<Instant>,
    interval: Option<Duration>,
    callback: Arc<dyn Fn() + Send + Sync>,
}

pub struct EventLoop {
    log: Logger,
    poll: Mutex<Poll>,
    registry: Registry,
    waker: Waker,
    interrupt_requested: AtomicBool,
    interrupted: AtomicBool,
    registrations: Mutex<HashMap<RawFd, Registration>>,
    timers: Mutex<HashMap<u64, TimerEntry>>,
    next_timer_id: AtomicU64,
}

impl EventLoop {
    pub fn new<'a, L>(log: L) -> Result<Arc<EventLoop>>
    where
        L: Into<Option<&'a Logger>>,
    {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        Ok(Arc::new(EventLoop {
            log: logging::child(log, "event_loop"),
            poll: Mutex::new(poll),
            registry,
            waker,
            interrupt_requested: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            registrations: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            next_timer_id: AtomicU64::new(1),
        }))
    }

    /// Registers `fd` with the given interest. Registering an fd twice is a
    /// programming error and panics.
    pub fn add<F>(&self, fd: RawFd, interest: Ready, callback: F) -> Result<()>
    where
        F: Fn(RawFd, Ready) -> Result<()> + Send + Sync + 'static,
    {
        trace!(self.log, "adding fd"; "fd" => fd, "interest" => ?interest);

        let mut registrations = self.registrations.lock().unwrap();
        assert!(
            !registrations.contains_key(&fd),
            "fd {} is already registered",
            fd
        );

        self.registry
            .register(&mut SourceFd(&fd), Token(fd as usize), mio_interest(interest))?;

        registrations.insert(
            fd,
            Registration {
                interest,
                callback: Arc::new(callback),
            },
        );
        Ok(())
    }

    /// Changes the interest of a registered fd; the callback is unchanged.
    /// Re-registration delivers a fresh readiness edge when the condition
    /// already holds, which the I/O pumps rely on.
    pub fn modify(&self, fd: RawFd, interest: Ready) -> Result<()> {
        trace!(self.log, "modifying fd"; "fd" => fd, "interest" => ?interest);

        let mut registrations = self.registrations.lock().unwrap();
        let registration = registrations
            .get_mut(&fd)
            .unwrap_or_else(|| panic!("fd {} is not registered", fd));

        self.registry
            .reregister(&mut SourceFd(&fd), Token(fd as usize), mio_interest(interest))?;

        registration.interest = interest;
        Ok(())
    }

    /// Deregisters `fd` and drops its callback. Removing an unknown fd is a
    /// programming error and panics.
    pub fn remove(&self, fd: RawFd) -> Result<()> {
        trace!(self.log, "removing fd"; "fd" => fd);

        let mut registrations = self.registrations.lock().unwrap();
        assert!(registrations.contains_key(&fd), "fd {} is not registered", fd);

        self.registry.deregister(&mut SourceFd(&fd))?;
        registrations.remove(&fd);
        Ok(())
    }

    /// Blocks up to `timeout` waiting for readiness, dispatching one ready
    /// event per wakeup. Returns when the timeout elapses with no event,
    /// or promptly after [`EventLoop::interrupt`]. `None` blocks
    /// indefinitely; a zero timeout polls. A callback returning an error
    /// aborts the dispatch and propagates the error.
    pub fn dispatch(&self, timeout: Option<Duration>) -> Result<()> {
        let mut poll = self.poll.lock().unwrap();
        let mut events = Events::with_capacity(1);

        self.interrupted.store(false, Ordering::SeqCst);

        loop {
            if self.interrupted.load(Ordering::SeqCst) {
                return Ok(());
            }

            for callback in self.due_timers() {
                callback();
            }

            if self.interrupted.load(Ordering::SeqCst) {
                return Ok(());
            }

            let (wait, timer_bound) = self.poll_timeout(timeout);

            events.clear();
            if let Err(err) = poll.poll(&mut events, wait) {
                if io::ErrorKind::Interrupted == err.kind() {
                    continue;
                }
                return Err(err.into());
            }

            if events.is_empty() {
                // Either a timer deadline shortened the wait or the
                // caller's timeout elapsed without an event.
                if timer_bound {
                    continue;
                }
                match timeout {
                    Some(_) => return Ok(()),
                    None => continue,
                }
            }

            for event in events.iter() {
                if WAKER_TOKEN == event.token() {
                    if self.interrupt_requested.swap(false, Ordering::SeqCst) {
                        self.interrupted.store(true, Ordering::SeqCst);
                    }
                    continue;
                }

                let fd = event.token().0 as RawFd;
                let ready = ready_of(event);

                let dispatch = {
                    let registrations = self.registrations.lock().unwrap();
                    match registrations.get(&fd) {
                        None => continue,
                        Some(registration) => {
                            let deliver =
                                ready & (registration.interest | Ready::ERROR | Ready::HUP);
                            if deliver.is_empty() {
                                continue;
                            }
                            (registration.callback.clone(), deliver)
                        }
                    }
                };

                (dispatch.0)(fd, dispatch.1)?;
            }
        }
    }

    /// May be called from any thread; an in-progress `dispatch` returns
    /// promptly after the current callback completes.
    pub fn interrupt(&self) {
        self.interrupt_requested.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();

        trace!(self.log, "interrupted");
    }

    //
    // Timer wheel, used through `crate::timer::Timer`.
    //

    pub(crate) fn timer_create(&self, callback: Arc<dyn Fn() + Send + Sync>) -> u64 {
        let id = self.next_timer_id.fetch_add(1, Ordering::SeqCst);
        self.timers.lock().unwrap().insert(
            id,
            TimerEntry {
                deadline: None,
                interval: None,
                callback,
            },
        );
        id
    }

    pub(crate) fn timer_set(&self, id: u64, expire: Duration, interval: Option<Duration>) {
        {
            let mut timers = self.timers.lock().unwrap();
            if let Some(entry) = timers.get_mut(&id) {
                entry.deadline = Some(Instant::now() + expire);
                entry.interval = interval;
            }
        }
        // Recompute the poll timeout of a blocked dispatch.
        let _ = self.waker.wake();
    }

    pub(crate) fn timer_clear(&self, id: u64) {
        let mut timers = self.timers.lock().unwrap();
        if let Some(entry) = timers.get_mut(&id) {
            entry.deadline = None;
            entry.interval = None;
        }
    }

    pub(crate) fn timer_destroy(&self, id: u64) {
        self.timers.lock().unwrap().remove(&id);
    }

    fn due_timers(&self) -> Vec<Arc<dyn Fn() + Send + Sync>> {
        let now = Instant::now();
        let mut due = Vec::new();

        let mut timers = self.timers.lock().unwrap();
        for entry in timers.values_mut() {
            match entry.deadline {
                Some(deadline) if deadline <= now => {
                    due.push(entry.callback.clone());
                    entry.deadline = entry.interval.map(|interval| now + interval);
                }
                _ => (),
            }
        }
        due
    }

    fn poll_timeout(&self, timeout: Option<Duration>) -> (Option<Duration>, bool) {
        let next = {
            let timers = self.timers.lock().unwrap();
            timers.values().filter_map(|entry| entry.deadline).min()
        };

        let timer_wait = next.map(|deadline| deadline.saturating_duration_since(Instant::now()));

        match (timeout, timer_wait) {
            (None, None) => (None, false),
            (Some(timeout), None) => (Some(timeout), false),
            (None, Some(wait)) => (Some(wait), true),
            (Some(timeout), Some(wait)) => {
                if wait < timeout {
                    (Some(wait), true)
                } else {
                    (Some(timeout), false)
                }
            }
        }
    }
}

fn mio_interest(interest: Ready) -> mio::Interest {
    match (interest.is_readable(), interest.is_writable()) {
        (true, true) => mio::Interest::READABLE.add(mio::Interest::WRITABLE),
        (false, true) => mio::Interest::WRITABLE,
        // mio requires a non-empty interest; an idle registration falls
        // back to READABLE and the delivery mask drops the events.
        _ => mio::Interest::READABLE,
    }
}

fn ready_of(event: &mio::event::Event) -> Ready {
    let mut ready = Ready::NONE;
    if event.is_readable() {
        ready |= Ready::READ;
    }
    if event.is_writable() {
        ready |= Ready::WRITE;
    }
    if event.is_error() {
        ready |= Ready::ERROR;
    }
    if event.is_read_closed() && event.is_write_closed() {
        ready |= Ready::HUP;
    }
    ready
}
