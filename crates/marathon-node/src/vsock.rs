//! Host side of the VM transport: an AF_VSOCK listener bound with the
//! wildcard CID. Each guest agent connects out to the host when it boots and
//! announces itself with `vsock_ready`; connections are then claimable by
//! task runners, matched on the guest's CID.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use marathon_protocol::Frame;
use marathon_protocol::MsgType;
use marathon_protocol::messages::VsockReady;
use marathon_protocol::wire::decode_exact;
use socket2::{Domain, SockAddr, Socket, Type};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum VsockError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] marathon_protocol::Error),

    #[error("guest cid {0} did not announce itself in time")]
    GuestTimeout(u32),
}

/// A connected, announced guest. Reads carry a timeout so task runners can
/// poll cancellation between frames.
#[derive(Debug)]
pub struct GuestConn {
    sock: Socket,
    pub cid: u32,
    pub agent_version: String,
}

impl GuestConn {
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.sock.set_read_timeout(timeout)
    }

    pub fn read_frame(&mut self) -> Result<Option<Frame>, marathon_protocol::Error> {
        Frame::read_from(&mut self.sock)
    }

    pub fn write_frame(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.sock.write_all(bytes)?;
        self.sock.flush()
    }
}

#[derive(Default)]
struct Announced {
    guests: HashMap<u32, GuestConn>,
}

/// The vsock listener plus the set of announced-but-unclaimed guests.
pub struct VsockHost {
    announced: Mutex<Announced>,
    arrival: Condvar,
}

impl VsockHost {
    pub fn new() -> Arc<Self> {
        Arc::new(VsockHost {
            announced: Mutex::new(Announced::default()),
            arrival: Condvar::new(),
        })
    }

    /// Bind the wildcard-CID listener and spawn the accept thread.
    pub fn start(
        self: Arc<Self>,
        port: u32,
        keep_running: &'static AtomicBool,
    ) -> Result<std::thread::JoinHandle<()>, VsockError> {
        let listener = Socket::new(Domain::VSOCK, Type::STREAM, None)?;
        listener.bind(&SockAddr::vsock(libc::VMADDR_CID_ANY, port))?;
        listener.listen(64)?;
        listener.set_nonblocking(true)?;

        let handle = std::thread::Builder::new()
            .name("vsock-accept".to_string())
            .spawn(move || self.accept_loop(listener, keep_running))
            .expect("spawning vsock accept thread");

        Ok(handle)
    }

    fn accept_loop(self: Arc<Self>, listener: Socket, keep_running: &'static AtomicBool) {
        while keep_running.load(Relaxed) {
            match listener.accept() {
                Ok((sock, peer)) => {
                    let Some(addr) = peer.as_vsock_address() else {
                        warn!("vsock accept returned a non-vsock peer");
                        continue;
                    };
                    let cid = addr.0;

                    if let Err(e) = sock.set_nonblocking(false) {
                        warn!("guest cid {cid}: {e}");
                        continue;
                    }

                    match self.announce(sock, cid) {
                        Ok(()) => debug!("guest cid {cid} announced"),
                        Err(e) => warn!("guest cid {cid} rejected: {e}"),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    warn!("vsock accept failed: {e}");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    /// Read the guest's `vsock_ready`, then file the connection for pickup.
    fn announce(&self, mut sock: Socket, cid: u32) -> Result<(), VsockError> {
        sock.set_read_timeout(Some(Duration::from_secs(5)))?;

        let frame = Frame::read_from(&mut sock)?
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;

        if frame.header.msg_type != MsgType::VsockReady {
            return Err(marathon_protocol::Error::InvalidMessageType(frame.header.msg_type as u8).into());
        }

        let mut payload = frame.payload;
        let ready = decode_exact::<VsockReady>(&mut payload)?;

        let conn = GuestConn {
            sock,
            cid,
            agent_version: ready.agent_version,
        };

        let mut announced = self.announced.lock().unwrap();
        if announced.guests.insert(cid, conn).is_some() {
            warn!("guest cid {cid} re-announced; replacing the stale connection");
        }
        self.arrival.notify_all();
        Ok(())
    }

    /// Claim the connection for `cid`, waiting up to `timeout` for the guest
    /// to come up and announce.
    pub fn claim(&self, cid: u32, timeout: Duration) -> Result<GuestConn, VsockError> {
        let deadline = Instant::now() + timeout;
        let mut announced = self.announced.lock().unwrap();

        loop {
            if let Some(conn) = announced.guests.remove(&cid) {
                return Ok(conn);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(VsockError::GuestTimeout(cid));
            }

            let (guard, _timed_out) = self
                .arrival
                .wait_timeout(announced, deadline - now)
                .unwrap();
            announced = guard;
        }
    }

    /// Drop a stale announced connection (e.g. after its VM was torn down).
    pub fn forget(&self, cid: u32) {
        let mut announced = self.announced.lock().unwrap();
        announced.guests.remove(&cid);
    }

    pub fn announced_count(&self) -> usize {
        self.announced.lock().unwrap().guests.len()
    }
}
