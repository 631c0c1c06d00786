//! Optional TLS wrapping for the TCP links, plus the split read/write stream
//! both plaintext and TLS connections are handled through.
//!
//! Marathon's connection handlers use one reader thread and one writer
//! thread per connection. A plain `TcpStream` splits with `try_clone`. For
//! TLS the rustls session is shared behind a mutex; socket reads happen
//! outside the lock into a scratch buffer that is then fed to the session,
//! so no thread ever blocks on the network while holding the session lock.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("reading '{0}': {1}")]
    ReadFile(String, std::io::Error),

    #[error("no certificates found in '{0}'")]
    NoCertificates(String),

    #[error("no private key found in '{0}'")]
    NoPrivateKey(String),

    #[error("invalid server hostname '{0}'")]
    InvalidHostname(String),

    #[error("{0}")]
    Rustls(#[from] rustls::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build a server config from PEM cert chain and private key files.
pub fn load_server_config(cert_path: &str, key_path: &str) -> Result<Arc<ServerConfig>, TlsError> {
    let certs = read_certs(cert_path)?;

    let key_file = File::open(key_path).map_err(|e| TlsError::ReadFile(key_path.to_string(), e))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| TlsError::ReadFile(key_path.to_string(), e))?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_string()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}

/// Build a client config that trusts exactly the CA bundle at `ca_path`.
/// Server hostname verification is always on; the caller supplies the
/// expected name when connecting.
pub fn load_client_config(ca_path: &str) -> Result<Arc<ClientConfig>, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(ca_path)? {
        roots.add(cert)?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

fn read_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, TlsError> {
    let file = File::open(Path::new(path)).map_err(|e| TlsError::ReadFile(path.to_string(), e))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|e| TlsError::ReadFile(path.to_string(), e))?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_string()));
    }
    Ok(certs)
}

/// A connection to a peer, possibly TLS-wrapped. Splittable into independent
/// read and write halves for the reader/writer thread pair.
pub enum Link {
    Plain(TcpStream),
    Tls(SharedTls),
}

impl Link {
    pub fn plain(stream: TcpStream) -> Self {
        Link::Plain(stream)
    }

    /// Accept-side TLS: runs the handshake to completion before returning.
    pub fn tls_server(stream: TcpStream, config: Arc<ServerConfig>) -> Result<Self, TlsError> {
        let conn = ServerConnection::new(config)?;
        SharedTls::handshake(stream, Connection::Server(conn)).map(Link::Tls)
    }

    /// Connect-side TLS: verifies the server certificate against `hostname`.
    pub fn tls_client(
        stream: TcpStream,
        config: Arc<ClientConfig>,
        hostname: &str,
    ) -> Result<Self, TlsError> {
        let name = ServerName::try_from(hostname.to_string())
            .map_err(|_| TlsError::InvalidHostname(hostname.to_string()))?;
        let conn = ClientConnection::new(config, name)?;
        SharedTls::handshake(stream, Connection::Client(conn)).map(Link::Tls)
    }

    pub fn split(self) -> std::io::Result<(LinkReader, LinkWriter)> {
        match self {
            Link::Plain(stream) => {
                let writer = stream.try_clone()?;
                Ok((LinkReader::Plain(stream), LinkWriter::Plain(writer)))
            }
            Link::Tls(shared) => {
                let (reader, writer) = shared.split()?;
                Ok((LinkReader::Tls(reader), LinkWriter::Tls(writer)))
            }
        }
    }
}

pub enum LinkReader {
    Plain(TcpStream),
    Tls(TlsReadHalf),
}

impl Read for LinkReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            LinkReader::Plain(stream) => stream.read(buf),
            LinkReader::Tls(half) => half.read(buf),
        }
    }
}

pub enum LinkWriter {
    Plain(TcpStream),
    Tls(TlsWriteHalf),
}

impl Write for LinkWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            LinkWriter::Plain(stream) => stream.write(buf),
            LinkWriter::Tls(half) => half.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            LinkWriter::Plain(stream) => stream.flush(),
            LinkWriter::Tls(half) => half.flush(),
        }
    }
}

/// A rustls session shared by a read half and a write half. The mutex guards
/// only in-memory session operations; both halves use their own clone of the
/// socket for network I/O.
pub struct SharedTls {
    conn: Arc<Mutex<Connection>>,
    sock: TcpStream,
}

impl SharedTls {
    fn handshake(mut sock: TcpStream, mut conn: Connection) -> Result<Self, TlsError> {
        while conn.is_handshaking() {
            conn.complete_io(&mut sock)?;
        }

        Ok(SharedTls {
            conn: Arc::new(Mutex::new(conn)),
            sock,
        })
    }

    fn split(self) -> std::io::Result<(TlsReadHalf, TlsWriteHalf)> {
        let read_sock = self.sock.try_clone()?;

        let reader = TlsReadHalf {
            conn: Arc::clone(&self.conn),
            sock: read_sock,
        };
        let writer = TlsWriteHalf {
            conn: self.conn,
            sock: self.sock,
        };
        Ok((reader, writer))
    }
}

pub struct TlsReadHalf {
    conn: Arc<Mutex<Connection>>,
    sock: TcpStream,
}

impl TlsReadHalf {
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Read for TlsReadHalf {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            // Drain any plaintext already decrypted by the session.
            {
                let mut conn = self.lock();
                match conn.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => (),
                    Err(e) => return Err(e),
                }
            }

            // No plaintext ready: block on the socket without the lock, then
            // feed whatever arrived into the session.
            let mut scratch = [0u8; 16 * 1024];
            let n = self.sock.read(&mut scratch)?;

            let mut conn = self.lock();
            if n == 0 {
                // EOF from the peer; let the session surface close_notify
                // (or an unexpected-EOF error) through its reader.
                conn.read_tls(&mut std::io::empty())?;
            } else {
                let mut incoming = &scratch[..n];
                while !incoming.is_empty() {
                    conn.read_tls(&mut incoming)?;
                }
            }

            conn.process_new_packets()
                .map_err(|e| std::io::Error::other(e.to_string()))?;
        }
    }
}

pub struct TlsWriteHalf {
    conn: Arc<Mutex<Connection>>,
    sock: TcpStream,
}

impl Write for TlsWriteHalf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut conn = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        conn.writer().write_all(buf)?;

        while conn.wants_write() {
            conn.write_tls(&mut self.sock)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while conn.wants_write() {
            conn.write_tls(&mut self.sock)?;
        }
        self.sock.flush()
    }
}
