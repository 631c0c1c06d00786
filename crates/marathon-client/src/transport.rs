//! Blocking request/response transport to the orchestrator, with optional
//! TLS (CA bundle + server hostname verification).

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use marathon_common::tls::{Link, LinkReader, LinkWriter, TlsError, load_client_config};
use marathon_protocol::messages::{ErrorResponse, TaskResponse, UsageResponse};
use marathon_protocol::wire::decode_exact;
use marathon_protocol::{Frame, MsgType, ToWire};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("could not resolve '{0}'")]
    DnsLookupFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Tls(#[from] TlsError),

    #[error("protocol error: {0}")]
    Protocol(#[from] marathon_protocol::Error),

    #[error("server closed the connection")]
    ConnectionClosed,

    #[error("{code}: {message}")]
    Remote { code: String, message: String },

    #[error("unexpected {0} response")]
    UnexpectedResponse(MsgType),

    #[error("server returned no task record")]
    EmptyResponse,
}

pub struct Connection {
    reader: LinkReader,
    writer: LinkWriter,
    next_request_id: u32,
}

impl Connection {
    pub fn connect(
        host: &str,
        port: u16,
        tls_ca_path: Option<&str>,
        tls_hostname: Option<&str>,
    ) -> Result<Connection, ClientError> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|_| ClientError::DnsLookupFailed(host.to_string()))?
            .next()
            .ok_or_else(|| ClientError::DnsLookupFailed(host.to_string()))?;

        debug!("connecting to {addr}");
        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(5))?;
        stream.set_nodelay(true)?;

        let link = match tls_ca_path {
            Some(ca) => {
                let config = load_client_config(ca)?;
                let hostname = tls_hostname.unwrap_or(host);
                Link::tls_client(stream, config, hostname)?
            }
            None => Link::plain(stream),
        };

        let (reader, writer) = link.split()?;
        Ok(Connection {
            reader,
            writer,
            next_request_id: 1,
        })
    }

    pub fn send<T: ToWire>(&mut self, msg_type: MsgType, payload: &T) -> Result<u32, ClientError> {
        use std::io::Write;

        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);

        let bytes = marathon_protocol::frame::encode(msg_type, 0, request_id, payload)?;
        trace!("sending {msg_type} request {request_id} ({} bytes)", bytes.len());
        trace_dump(&bytes)?;

        self.writer.write_all(&bytes)?;
        self.writer.flush()?;
        Ok(request_id)
    }

    pub fn read_frame(&mut self) -> Result<Frame, ClientError> {
        match Frame::read_from(&mut self.reader)? {
            Some(frame) => {
                trace!(
                    "received {} ({} payload bytes)",
                    frame.header.msg_type, frame.header.payload_len
                );
                trace_dump(&frame.payload)?;
                Ok(frame)
            }
            None => Err(ClientError::ConnectionClosed),
        }
    }

    /// Send a request whose answer is a `task_response`. Streaming task
    /// events interleaved on the connection are skipped.
    pub fn round_trip_task<T: ToWire>(
        &mut self,
        msg_type: MsgType,
        payload: &T,
    ) -> Result<TaskResponse, ClientError> {
        self.send(msg_type, payload)?;

        loop {
            let frame = self.read_frame()?;
            match frame.header.msg_type {
                MsgType::TaskResponse => {
                    let mut payload = frame.payload;
                    return Ok(decode_exact::<TaskResponse>(&mut payload)?);
                }
                MsgType::TaskEvent => continue,
                other => return Err(self.unexpected(other, frame.payload)),
            }
        }
    }

    /// Send a request whose answer is a `usage_response`.
    pub fn round_trip_usage<T: ToWire>(
        &mut self,
        msg_type: MsgType,
        payload: &T,
    ) -> Result<UsageResponse, ClientError> {
        self.send(msg_type, payload)?;

        loop {
            let frame = self.read_frame()?;
            match frame.header.msg_type {
                MsgType::UsageResponse => {
                    let mut payload = frame.payload;
                    return Ok(decode_exact::<UsageResponse>(&mut payload)?);
                }
                MsgType::TaskEvent => continue,
                other => return Err(self.unexpected(other, frame.payload)),
            }
        }
    }

    fn unexpected(&self, msg_type: MsgType, mut payload: Vec<u8>) -> ClientError {
        if msg_type == MsgType::ErrorResponse
            && let Ok(error) = decode_exact::<ErrorResponse>(&mut payload)
        {
            return ClientError::Remote {
                code: error.code,
                message: error.message,
            };
        }
        ClientError::UnexpectedResponse(msg_type)
    }
}

fn trace_dump(data: &[u8]) -> Result<(), ClientError> {
    if tracing::enabled!(tracing::Level::TRACE) {
        let mut dump = Vec::new();
        marathon_common::encoding::hexdump(data, &mut dump)?;
        trace!("\n{}", String::from_utf8_lossy(&dump));
    }
    Ok(())
}
