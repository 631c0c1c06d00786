//! The node's connection to the orchestrator. One writer thread serializes
//! all outgoing frames (heartbeats and per-task forwarding threads share the
//! socket); one reader thread routes heartbeat responses back to the
//! heartbeat loop.

use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use marathon_common::tls::{Link, TlsError};
use marathon_protocol::messages::HeartbeatResponse;
use marathon_protocol::wire::decode_exact;
use marathon_protocol::{Frame, MsgType, ToWire};
use rustls::ClientConfig;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroize;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("could not resolve '{0}'")]
    DnsLookupFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Tls(#[from] TlsError),

    #[error("orchestrator link is down")]
    Disconnected,

    #[error("no heartbeat response within {0:?}")]
    HeartbeatTimeout(Duration),
}

const OUTBOUND_DEPTH: usize = 512;

/// How many undelivered heartbeat responses to buffer; in practice at most
/// one is in flight.
const RESPONSE_DEPTH: usize = 4;

pub struct OrchestratorLink {
    outbound: Sender<Vec<u8>>,
    responses: Receiver<HeartbeatResponse>,
    alive: Arc<AtomicBool>,
    next_request_id: AtomicU32,
}

impl OrchestratorLink {
    /// Connect, optionally with TLS, and spawn the reader/writer pair.
    pub fn connect(
        host: &str,
        port: u16,
        tls: Option<(Arc<ClientConfig>, String)>,
    ) -> Result<OrchestratorLink, LinkError> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|_| LinkError::DnsLookupFailed(host.to_string()))?
            .next()
            .ok_or_else(|| LinkError::DnsLookupFailed(host.to_string()))?;

        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(5))?;
        stream.set_nodelay(true)?;

        let link = match tls {
            Some((config, hostname)) => Link::tls_client(stream, config, &hostname)?,
            None => Link::plain(stream),
        };
        let (mut reader, mut writer) = link.split()?;

        let alive = Arc::new(AtomicBool::new(true));
        let (out_tx, out_rx): (Sender<Vec<u8>>, Receiver<Vec<u8>>) = bounded(OUTBOUND_DEPTH);
        let (resp_tx, resp_rx) = bounded(RESPONSE_DEPTH);

        let writer_alive = Arc::clone(&alive);
        std::thread::Builder::new()
            .name("orch-writer".to_string())
            .spawn(move || {
                for mut bytes in out_rx {
                    let result = writer.write_all(&bytes).and_then(|()| writer.flush());
                    bytes.zeroize();
                    if let Err(e) = result {
                        debug!("orchestrator writer exiting: {e}");
                        break;
                    }
                }
                writer_alive.store(false, Relaxed);
            })
            .expect("spawning orchestrator writer");

        let reader_alive = Arc::clone(&alive);
        std::thread::Builder::new()
            .name("orch-reader".to_string())
            .spawn(move || {
                loop {
                    match Frame::read_from(&mut reader) {
                        Ok(Some(frame)) => route_frame(frame, &resp_tx),
                        Ok(None) => {
                            debug!("orchestrator closed the connection");
                            break;
                        }
                        Err(e) => {
                            warn!("orchestrator link read failed: {e}");
                            break;
                        }
                    }
                }
                reader_alive.store(false, Relaxed);
            })
            .expect("spawning orchestrator reader");

        Ok(OrchestratorLink {
            outbound: out_tx,
            responses: resp_rx,
            alive,
            next_request_id: AtomicU32::new(1),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Relaxed)
    }

    pub fn next_request_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Relaxed)
    }

    /// Queue a frame for the writer thread.
    pub fn send<T: ToWire>(&self, msg_type: MsgType, request_id: u32, payload: &T) -> Result<(), LinkError> {
        let bytes = marathon_protocol::frame::encode(msg_type, 0, request_id, payload)
            .map_err(|e| {
                warn!("encoding {msg_type}: {e}");
                LinkError::Disconnected
            })?;

        self.outbound.send(bytes).map_err(|_| LinkError::Disconnected)
    }

    /// Re-frame an already-encoded payload (relayed from a guest) without
    /// decoding it first.
    pub fn send_raw(&self, msg_type: MsgType, payload: Vec<u8>) -> Result<(), LinkError> {
        use marathon_protocol::frame::{FrameHeader, HEADER_SIZE};

        let header = FrameHeader::new(msg_type, payload.len() as u32, self.next_request_id());
        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
        match header.as_bytes() {
            Ok(head) => bytes.extend_from_slice(&head),
            Err(e) => {
                warn!("encoding {msg_type} header: {e}");
                return Err(LinkError::Disconnected);
            }
        }
        bytes.extend_from_slice(&payload);

        self.outbound.send(bytes).map_err(|_| LinkError::Disconnected)
    }

    /// Send a heartbeat and wait for the orchestrator's command batch.
    pub fn heartbeat<T: ToWire>(&self, request: &T, timeout: Duration) -> Result<HeartbeatResponse, LinkError> {
        // Drop any stale response from an earlier timed-out exchange so the
        // next receive matches this request.
        while self.responses.try_recv().is_ok() {}

        self.send(MsgType::HeartbeatRequest, self.next_request_id(), request)?;

        self.responses
            .recv_timeout(timeout)
            .map_err(|_| {
                if self.is_alive() {
                    LinkError::HeartbeatTimeout(timeout)
                } else {
                    LinkError::Disconnected
                }
            })
    }
}

fn route_frame(frame: Frame, responses: &Sender<HeartbeatResponse>) {
    match frame.header.msg_type {
        MsgType::HeartbeatResponse => {
            let mut payload = frame.payload;
            match decode_exact::<HeartbeatResponse>(&mut payload) {
                Ok(response) => {
                    // The raw bytes may carry injected tokens
                    payload.zeroize();
                    if responses.try_send(response).is_err() {
                        warn!("dropping heartbeat response: receiver not draining");
                    }
                }
                Err(e) => warn!("malformed heartbeat response: {e}"),
            }
        }
        MsgType::ErrorResponse => {
            warn!("orchestrator reported an error for request {}", frame.header.request_id);
        }
        other => debug!("ignoring {other} frame from orchestrator"),
    }
}
