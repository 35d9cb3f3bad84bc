//! Tokio Unix Domain Socket control endpoint (§6, §7).
//!
//! One listener accepts every application/uipcp connection for a single
//! `Dm`; each accepted stream becomes one `ControlDevice`, registered with
//! the `Dm` for its lifetime and deregistered (with registration cleanup)
//! on disconnect. Framing is length-prefixed, little-endian, the same
//! shape the teacher's `ipc/unix_domain_socket.rs` uses for its
//! `read_message`/`write_message` pair; the capability check that
//! distinguishes privileged from unprivileged connections (§4.H) is done
//! once at accept time via the peer's credentials, since this crate has
//! "no security beyond a simple privileged/unprivileged capability check"
//! (§7).

use crate::control_device::ControlDevice;
use crate::dispatcher::Dispatcher;
use crate::dm::Dm;
use crate::factory::FactoryRegistry;
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// Ceiling on a single encoded control message, matching the teacher's UDS
/// transport's 16 MiB frame limit.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Reads one length-prefixed frame from `stream`.
async fn read_frame(stream: &mut OwnedReadHalf) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(anyhow!("control message too large: {len} bytes"));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Writes one length-prefixed frame to `stream`.
async fn write_frame(stream: &mut OwnedWriteHalf, bytes: &[u8]) -> Result<()> {
    stream.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Resolves the peer's credentials and decides whether the connection is
/// privileged. Any failure to read credentials (including platforms
/// without `SO_PEERCRED`) degrades to unprivileged rather than failing the
/// accept, the same conservative default a capability check should have.
#[cfg(target_os = "linux")]
fn is_privileged_peer(stream: &UnixStream) -> bool {
    use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
    match getsockopt(stream, PeerCredentials) {
        Ok(cred) => cred.uid() == 0,
        Err(e) => {
            warn!(error = %e, "peer credential lookup failed; treating connection as unprivileged");
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn is_privileged_peer(_stream: &UnixStream) -> bool {
    false
}

/// Owns the listening socket for one `Dm`. Dropping it removes the socket
/// file, mirroring `UnixDomainSocketTransport::cleanup_socket`.
pub struct Server {
    listener: UnixListener,
    socket_path: String,
    dm: Arc<Dm>,
    dispatcher: Arc<Dispatcher>,
}

impl Server {
    /// Binds `socket_path`, removing a stale socket file left behind by a
    /// previous run and relaxing permissions so any local user can connect
    /// (the capability check at accept time is what actually gates
    /// privileged operations).
    pub fn bind(
        socket_path: impl Into<String>,
        dm: Arc<Dm>,
        factories: Arc<tokio::sync::Mutex<FactoryRegistry>>,
    ) -> Result<Self> {
        let socket_path = socket_path.into();
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("binding control socket at {socket_path}"))?;
        #[cfg(unix)]
        {
            use std::fs;
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o666));
        }
        let dispatcher = Arc::new(Dispatcher::new(dm.clone(), factories));
        Ok(Self {
            listener,
            socket_path,
            dm,
            dispatcher,
        })
    }

    /// Accepts connections forever, spawning one task per client. Returns
    /// only on a fatal accept error.
    pub async fn run(self) -> Result<()> {
        info!(socket = %self.socket_path, "control socket listening");
        loop {
            let (stream, _addr) = self
                .listener
                .accept()
                .await
                .context("accepting control connection")?;
            let dm = self.dm.clone();
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                handle_connection(stream, dm, dispatcher).await;
            });
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Drives one accepted connection to completion: registers its
/// `ControlDevice`, pumps the upstream queue onto the wire, dispatches
/// every inbound frame, and cleans up on disconnect.
async fn handle_connection(stream: UnixStream, dm: Arc<Dm>, dispatcher: Arc<Dispatcher>) {
    let privileged = is_privileged_peer(&stream);
    let device = Arc::new(ControlDevice::new(dm.namespace.clone()));
    device.set_privileged(privileged);
    dm.register_device(device.clone()).await;
    debug!(device_id = device.id, privileged, "control connection accepted");

    let (mut read_half, mut write_half) = stream.into_split();

    let writer_device = device.clone();
    let writer = tokio::spawn(async move {
        let mut buf = vec![0u8; crate::queue::UPQUEUE_SIZE_MAX];
        loop {
            match writer_device.upstream.read(&mut buf, true).await {
                Ok(n) => {
                    if write_frame(&mut write_half, &buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    loop {
        match read_frame(&mut read_half).await {
            Ok(bytes) => {
                if let Err(e) = dispatcher.dispatch(&device, &bytes).await {
                    warn!(device_id = device.id, error = %e, "control request failed");
                }
            }
            Err(e) => {
                debug!(device_id = device.id, error = %e, "control connection closed");
                break;
            }
        }
    }

    writer.abort();
    dm.unregister_device(device.id).await;
    cleanup_device(&dm, device.id).await;
}

/// Reclaims state a closed control device still owned (§4.F "stolen" app
/// registrations, attached-uipcp forwarding): every application it had
/// registered on an IPCP is unregistered from that IPCP's table, and for
/// each one that had reached `Complete` (and so is actually known to an
/// uipcp's shadow state), the IPCP's attached uipcp is told via an
/// `APPL_REGISTER{reg:false}` notification (§8 scenario 5: "upstream to the
/// uipcp contains APPL_REGISTER{reg=false, ...}"). A still-`Pending`
/// registration was never confirmed, so no uipcp has a record of it to
/// revoke and none is notified.
async fn cleanup_device(dm: &Arc<Dm>, device_id: u64) {
    let stolen: Vec<(u16, crate::message::ApplName)> = {
        let mut registries = dm.app_registries.lock().await;
        let mut stolen = Vec::new();
        for (&ipcp_id, registry) in registries.iter_mut() {
            for (appl_name, state) in registry.take_owned_by(device_id) {
                if state == crate::app_registry::RegState::Complete {
                    stolen.push((ipcp_id, appl_name));
                }
            }
        }
        stolen
    };

    for (ipcp_id, appl_name) in stolen {
        let ipcp = dm.ipcps.lock().await.get(ipcp_id);
        let Some(ipcp) = ipcp else { continue };
        let Some(uipcp_id) = *ipcp.uipcp.lock() else { continue };
        let Some(target) = dm.devices.lock().await.iter().find(|d| d.id == uipcp_id).cloned() else {
            continue;
        };
        let msg = crate::message::CtrlMessage::new(
            MsgType::ApplRegister,
            0,
            Body::ApplRegister {
                dif_name: ipcp.dif.name.clone(),
                ipcp_id,
                appl_name,
                reg: false,
            },
        );
        let _ = target.upstream.append(&msg, false).await;
    }

    let ipcps = dm.ipcps.lock().await;
    for ipcp in ipcps.iter() {
        let mut uipcp = ipcp.uipcp.lock();
        if *uipcp == Some(device_id) {
            *uipcp = None;
        }
    }
}
