use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use mio::net::TcpStream;
use rustls::{Certificate, PrivateKey, ServerConfig, ServerConnection, StreamOwned};

use crate::error::{Error, Result};

/// One accepted connection, plain or TLS. The TLS session performs its
/// handshake lazily inside read/write; `WouldBlock` propagates from the
/// underlying socket either way. This is the unit of ownership that an
/// HTTP upgrade transfers to a new protocol owner.
pub enum Transport {
    Plain(TcpStream),
    Secure(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl Transport {
    pub fn accepted(stream: TcpStream, tls: Option<&Arc<ServerConfig>>) -> Result<Transport> {
        match tls {
            None => Ok(Transport::Plain(stream)),
            Some(config) => {
                let session = ServerConnection::new(config.clone())?;
                Ok(Transport::Secure(Box::new(StreamOwned::new(session, stream))))
            }
        }
    }

    #[inline]
    fn socket(&self) -> &TcpStream {
        match self {
            Transport::Plain(stream) => stream,
            Transport::Secure(stream) => &stream.sock,
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.socket().as_raw_fd()
    }

    pub fn set_nodelay(&self, enable: bool) -> io::Result<()> {
        self.socket().set_nodelay(enable)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket().peer_addr()
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.socket().take_error()
    }

    pub fn shutdown(&self) {
        let _ = self.socket().shutdown(Shutdown::Both);
    }
}

impl Read for Transport {
    fn read(&mut self, data: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.read(data),
            Transport::Secure(stream) => stream.read(data),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.write(data),
            Transport::Secure(stream) => stream.write(data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(stream) => stream.flush(),
            Transport::Secure(stream) => stream.flush(),
        }
    }
}

impl AsRawFd for Transport {
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}

/// Loads a PEM certificate chain and private key into a server-side TLS
/// configuration.
pub fn tls_server_config(certificate_file: &str, private_key_file: &str) -> Result<Arc<ServerConfig>> {
    let mut reader = BufReader::new(File::open(certificate_file)?);
    let certificates: Vec<Certificate> = rustls_pemfile::certs(&mut reader)?
        .into_iter()
        .map(Certificate)
        .collect();
    if certificates.is_empty() {
        return Err(Error::parse(format!(
            "no certificates in {}",
            certificate_file
        )));
    }

    let mut reader = BufReader::new(File::open(private_key_file)?);
    let key = rustls_pemfile::read_all(&mut reader)?
        .into_iter()
        .find_map(|item| match item {
            rustls_pemfile::Item::RSAKey(key) => Some(PrivateKey(key)),
            rustls_pemfile::Item::PKCS8Key(key) => Some(PrivateKey(key)),
            rustls_pemfile::Item::ECKey(key) => Some(PrivateKey(key)),
            _ => None,
        })
        .ok_or_else(|| Error::parse(format!("no private key in {}", private_key_file)))?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certificates, key)
        .map_err(Error::from)?;

    Ok(Arc::new(config))
}
