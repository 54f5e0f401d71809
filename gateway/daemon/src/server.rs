//! Daemon Server Implementation
//!
//! Serves the tool protocol's push carrier over a Unix socket:
//! - Accepts connections on the socket, one push session per connection
//! - Decodes CRC-checked frames into JSON-RPC messages
//! - Writes replies and server-initiated messages back as frames
//! - Tears the session down when the peer disconnects or sends a bad frame
//!
//! ```text
//!                      DaemonServer
//!                           │
//!           ┌───────────────┼───────────────┐
//!           │               │               │
//!       conn-1          conn-2          conn-3
//!     (push:conn-1)   (push:conn-2)   (push:conn-3)
//!           │               │               │
//!           └───────────────┴───────────────┘
//!                           │
//!                ProtocolSessionManager
//! ```

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use gateway_core::protocol::{FrameCodec, WriterSink};
use gateway_core::{CarrierKind, Gateway, JsonRpcError, JsonRpcMessage};

/// Bytes read from a socket per call
const READ_BUFFER_SIZE: usize = 8192;

/// Configuration for the daemon server
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
        }
    }
}

/// The main daemon server
pub struct DaemonServer {
    /// Path to the Unix socket
    socket_path: PathBuf,
    /// Gateway serving every session
    gateway: Arc<Gateway>,
    /// Server configuration
    server_config: ServerConfig,
    /// Live connection tasks by connection id
    connections: Arc<DashMap<String, tokio::task::AbortHandle>>,
    next_connection: AtomicU64,
}

impl DaemonServer {
    /// Create a new daemon server
    pub fn new(socket_path: PathBuf, gateway: Arc<Gateway>, server_config: ServerConfig) -> Self {
        Self {
            socket_path,
            gateway,
            server_config,
            connections: Arc::new(DashMap::new()),
            next_connection: AtomicU64::new(1),
        }
    }

    /// Get peer credentials from Unix socket
    #[cfg(unix)]
    fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
        use std::os::unix::io::AsRawFd;

        let fd = stream.as_raw_fd();
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        let mut len = libc::socklen_t::try_from(std::mem::size_of::<libc::ucred>()).ok()?;

        let result = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                std::ptr::addr_of_mut!(cred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if result == 0 {
            Some(cred.uid)
        } else {
            None
        }
    }

    /// Prepare the socket path (create directory, remove stale socket)
    fn prepare_socket(&self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create socket directory: {parent:?}"))?;
                info!(path = ?parent, "Created socket directory");
            }
        }

        if self.socket_path.exists() {
            warn!(path = ?self.socket_path, "Removing stale socket file");
            fs::remove_file(&self.socket_path).with_context(|| {
                format!("Failed to remove stale socket: {:?}", self.socket_path)
            })?;
        }

        Ok(())
    }

    /// Owner-only socket permissions
    fn restrict_socket(&self) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&self.socket_path, perms)
                .with_context(|| format!("Failed to restrict {:?}", self.socket_path))?;
        }
        Ok(())
    }

    /// Accept connections until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.prepare_socket()?;

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind to {:?}", self.socket_path))?;

        self.restrict_socket()?;
        info!(path = ?self.socket_path, "Listening for connections");

        loop {
            let stream = tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping accept loop");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => stream,
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            if self.connections.len() >= self.server_config.max_connections {
                warn!("Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            let peer_uid = Self::get_peer_uid(&stream);
            let our_uid = unsafe { libc::getuid() };
            if let Some(uid) = peer_uid {
                if uid != our_uid && uid != 0 {
                    warn!(
                        peer_uid = uid,
                        our_uid = our_uid,
                        "Rejecting connection from different user"
                    );
                    drop(stream);
                    continue;
                }
            }

            let conn_id = format!("conn-{}", self.next_connection.fetch_add(1, Ordering::Relaxed));
            info!(
                conn_id = %conn_id,
                peer_uid = ?peer_uid,
                active_connections = self.connections.len() + 1,
                "New connection accepted"
            );

            let gateway = Arc::clone(&self.gateway);
            let connections = Arc::clone(&self.connections);
            let task_id = conn_id.clone();
            let task = tokio::spawn(
                async move {
                    if let Err(e) = Self::handle_connection(&gateway, &task_id, stream).await {
                        warn!(error = %e, "Connection ended with error");
                    }
                    connections.remove(&task_id);
                }
                .instrument(tracing::info_span!("connection", conn_id = %conn_id)),
            );
            self.connections.insert(conn_id.clone(), task.abort_handle());
            if task.is_finished() {
                self.connections.remove(&conn_id);
            }
        }

        self.close_connections();
        Ok(())
    }

    /// Abort every connection task
    fn close_connections(&self) {
        let count = self.connections.len();
        for entry in self.connections.iter() {
            entry.value().abort();
        }
        self.connections.clear();
        if count > 0 {
            info!(count, "Closed active connections");
        }
    }

    /// Serve one push session until the peer goes away
    async fn handle_connection(gateway: &Gateway, conn_id: &str, stream: UnixStream) -> Result<()> {
        let protocol = gateway.protocol();
        let (mut reader, writer) = stream.into_split();

        let session = protocol
            .open_push(conn_id, Box::new(WriterSink::new(writer)))
            .await
            .context("Failed to open push session")?;

        let codec = FrameCodec::new(protocol.config().max_frame_size);
        let mut decoder = codec.decoder();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        'read: loop {
            let n = reader.read(&mut buf).await.context("Socket read failed")?;
            if n == 0 {
                debug!("Peer closed connection");
                break;
            }
            decoder.push(&buf[..n]);

            loop {
                let message = match decoder.decode::<JsonRpcMessage>() {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Dropping connection after bad frame");
                        break 'read;
                    }
                };

                let request_id = message.id.clone();
                let Err(e) = protocol.handle_push(&session, message).await else {
                    continue;
                };
                if !protocol.contains(&session, CarrierKind::Push) {
                    // Write failure already tore the session down
                    break 'read;
                }
                debug!(kind = %e.kind(), error = %e, "Push message rejected");
                if request_id.is_some() {
                    let reply = JsonRpcMessage::error_response(request_id, JsonRpcError::from(&e));
                    if protocol.notify(&session, &reply).await.is_err() {
                        break 'read;
                    }
                }
            }
        }

        protocol.teardown(&session, CarrierKind::Push).await;
        Ok(())
    }
}
