//! Building blocks for small networked services: a readiness event loop
//! with cross-thread posting, non-blocking byte pumps over sinks and
//! sources, an HTTP/1.1 server with streaming transactions, a WebSocket
//! server layered on upgraded connections and a compact binary codec with
//! a structurally equivalent JSON form.

pub mod codec;
pub mod error;
pub mod event_bus;
pub mod event_loop;
pub mod event_queue;
pub mod fsm;
pub mod http;
pub mod io;
pub mod logging;
pub mod timer;
pub mod ws;

pub use crate::error::{Error, Result};
pub use crate::event_bus::EventBus;
pub use crate::event_loop::{EventLoop, Ready};
pub use crate::event_queue::EventQueue;
pub use crate::io::buffer::Buffer;
pub use crate::timer::Timer;
