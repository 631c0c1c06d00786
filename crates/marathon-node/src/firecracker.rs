//! Driving the firecracker binary: process lifecycle and the minimal
//! HTTP-over-unix-socket API calls Marathon needs (snapshot restore, cold
//! boot configuration, instance start).

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum FirecrackerError {
    #[error("spawning '{0}': {1}")]
    Spawn(String, std::io::Error),

    #[error("API socket '{0}' did not appear")]
    ApiSocketMissing(PathBuf),

    #[error("API call {0} failed: {1}")]
    Api(String, String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How long to wait for the hypervisor's API socket after spawn.
const API_SOCKET_WAIT: Duration = Duration::from_secs(2);

/// A running firecracker process and its API socket.
pub struct VmProcess {
    child: Child,
    api_sock: PathBuf,
}

impl VmProcess {
    /// Spawn the hypervisor and wait for its API socket to come up.
    pub fn launch(bin: &str, api_sock: &Path) -> Result<VmProcess, FirecrackerError> {
        // A stale socket from a crashed predecessor blocks the bind.
        std::fs::remove_file(api_sock).ok();

        let child = Command::new(bin)
            .arg("--api-sock")
            .arg(api_sock)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| FirecrackerError::Spawn(bin.to_string(), e))?;

        let deadline = Instant::now() + API_SOCKET_WAIT;
        while !api_sock.exists() {
            if Instant::now() > deadline {
                let mut child = child;
                child.kill().ok();
                return Err(FirecrackerError::ApiSocketMissing(api_sock.to_path_buf()));
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        Ok(VmProcess {
            child,
            api_sock: api_sock.to_path_buf(),
        })
    }

    /// Restore a paused VM from a memory snapshot and resume it.
    pub fn restore_snapshot(&self, snapshot_path: &str) -> Result<(), FirecrackerError> {
        self.api_put(
            "/snapshot/load",
            &json!({
                "snapshot_path": snapshot_path,
                "mem_backend": {
                    "backend_type": "File",
                    "backend_path": format!("{snapshot_path}.mem"),
                },
                "resume_vm": true,
            }),
        )
    }

    /// Configure a VM from scratch: kernel, root filesystem, machine shape,
    /// and the vsock device.
    pub fn configure_cold_boot(
        &self,
        kernel_path: &str,
        rootfs_path: &str,
        cid: u32,
        vsock_uds: &Path,
    ) -> Result<(), FirecrackerError> {
        self.api_put(
            "/boot-source",
            &json!({
                "kernel_image_path": kernel_path,
                "boot_args": "console=ttyS0 reboot=k panic=1 pci=off",
            }),
        )?;

        self.api_put(
            "/drives/rootfs",
            &json!({
                "drive_id": "rootfs",
                "path_on_host": rootfs_path,
                "is_root_device": true,
                "is_read_only": false,
            }),
        )?;

        self.api_put(
            "/machine-config",
            &json!({
                "vcpu_count": 2,
                "mem_size_mib": 2048,
            }),
        )?;

        self.api_put(
            "/vsock",
            &json!({
                "guest_cid": cid,
                "uds_path": vsock_uds,
            }),
        )
    }

    pub fn start_instance(&self) -> Result<(), FirecrackerError> {
        self.api_put("/actions", &json!({"action_type": "InstanceStart"}))
    }

    /// Kill the hypervisor process and reap it.
    pub fn shutdown(mut self) {
        self.child.kill().ok();
        self.child.wait().ok();
    }

    /// One `PUT` against the firecracker API socket. The API always answers
    /// small JSON bodies, so a single read covers the response.
    fn api_put(&self, path: &str, body: &Value) -> Result<(), FirecrackerError> {
        let body = body.to_string();
        debug!("firecracker PUT {path} {body}");

        let mut stream = UnixStream::connect(&self.api_sock)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;

        write!(
            stream,
            "PUT {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        )?;
        stream.flush()?;

        let mut response = vec![0u8; 4096];
        let n = stream.read(&mut response)?;
        let head = String::from_utf8_lossy(&response[..n]);

        let status_line = head.lines().next().unwrap_or_default();
        let ok = status_line
            .split_whitespace()
            .nth(1)
            .is_some_and(|code| code.starts_with('2'));

        if !ok {
            return Err(FirecrackerError::Api(
                path.to_string(),
                status_line.to_string(),
            ));
        }
        Ok(())
    }
}
