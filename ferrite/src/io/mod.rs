//! Byte-oriented I/O: the [`Sink`] and [`Source`] abstractions, the
//! [`Buffer`] container implementing both, the [`Transport`] unifying
//! plain and TLS connections, and the [`FdIo`] non-blocking pump.

pub mod buffer;
pub mod fdio;
pub mod sink;
pub mod source;
pub mod transport;

pub use buffer::Buffer;
pub use fdio::FdIo;
pub use sink::Sink;
pub use source::Source;
pub use transport::Transport;
