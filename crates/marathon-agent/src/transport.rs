//! The agent's side of the VM transport: connect out to the host, announce
//! readiness, and share the write half across the runner threads.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use marathon_protocol::messages::VsockReady;
use marathon_protocol::{Frame, MsgType, ToWire};
use socket2::{Domain, SockAddr, Socket, Type};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] marathon_protocol::Error),
}

/// Connect to the host over vsock and announce this agent.
pub fn connect(port: u32) -> Result<HostConn, TransportError> {
    let sock = Socket::new(Domain::VSOCK, Type::STREAM, None)?;
    sock.connect(&SockAddr::vsock(libc::VMADDR_CID_HOST, port))?;
    debug!("connected to host on vsock port {port}");

    let writer = SharedWriter {
        sock: Arc::new(Mutex::new(sock.try_clone()?)),
    };

    let ready = VsockReady {
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    writer.send(MsgType::VsockReady, &ready)?;

    Ok(HostConn { sock, writer })
}

pub struct HostConn {
    sock: Socket,
    pub writer: SharedWriter,
}

impl HostConn {
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.sock.set_read_timeout(timeout)
    }

    pub fn read_frame(&mut self) -> Result<Option<Frame>, marathon_protocol::Error> {
        Frame::read_from(&mut self.sock)
    }
}

/// Write half shared between the main loop and runner threads; one frame is
/// written at a time.
#[derive(Clone)]
pub struct SharedWriter {
    sock: Arc<Mutex<Socket>>,
}

impl SharedWriter {
    pub fn send<T: ToWire>(&self, msg_type: MsgType, payload: &T) -> Result<(), TransportError> {
        let bytes = marathon_protocol::frame::encode(msg_type, 0, 0, payload)?;

        let mut sock = self.sock.lock().unwrap();
        sock.write_all(&bytes)?;
        sock.flush()?;
        Ok(())
    }
}
