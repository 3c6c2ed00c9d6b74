//! IPC server and client
//!
//! A name-addressed local stream endpoint: a Unix domain socket, or a named
//! pipe on Windows hosts. Multiple clients connect concurrently; each
//! connection task owns its write half, so responses and broadcast
//! notifications are naturally serialized per client.
//!
//! A framing violation (length zero or above the 1 MiB cap) terminates the
//! offending connection. A frame that parses as JSON but carries an
//! unknown `$type` gets no response and the connection stays up.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::handler::IpcHandler;
use super::protocol::{
    decode_payload, encode_frame, Envelope, NotificationBody, RequestBody, ResponseBody,
    LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE,
};
use crate::control::ControlService;
use crate::error::IpcError;
use crate::settings::SettingsStore;

/// Client-side connect timeout
pub const CLIENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the notification broadcast channel
const NOTIFICATION_CHANNEL_CAPACITY: usize = 64;

/// The per-host endpoint the control surface connects to
#[must_use]
pub fn default_endpoint() -> PathBuf {
    #[cfg(windows)]
    {
        PathBuf::from(r"\\.\pipe\SdfwServicePipe")
    }
    #[cfg(not(windows))]
    {
        PathBuf::from("/run/sdfw/sdfw.sock")
    }
}

/// IPC server configuration
#[derive(Debug, Clone)]
pub struct IpcServerConfig {
    /// Socket path (Unix) or pipe name (Windows)
    pub endpoint: PathBuf,
}

impl Default for IpcServerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
        }
    }
}

/// The IPC server
pub struct IpcServer {
    config: IpcServerConfig,
    handler: Arc<IpcHandler>,
    notifications_tx: broadcast::Sender<Envelope<NotificationBody>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl IpcServer {
    /// Create a server for the given endpoint
    #[must_use]
    pub fn new(config: IpcServerConfig, handler: Arc<IpcHandler>) -> Self {
        let (notifications_tx, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            handler,
            notifications_tx,
            shutdown_tx,
        }
    }

    /// Sender used to broadcast notifications to every connected client
    #[must_use]
    pub fn notifier(&self) -> broadcast::Sender<Envelope<NotificationBody>> {
        self.notifications_tx.clone()
    }

    /// Signal the accept loop and all connections to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Handle to trigger shutdown from elsewhere
    #[must_use]
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Forward status and settings events into client notifications
    ///
    /// Spawns two bridge tasks that stop with the server's shutdown signal.
    pub fn bridge_events(&self, control: &Arc<ControlService>, settings: &Arc<SettingsStore>) {
        let notifier = self.notifications_tx.clone();
        let mut status_rx = control.subscribe_status();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    change = status_rx.recv() => {
                        let Ok(change) = change else { break };
                        let _ = notifier.send(Envelope::new(NotificationBody::StatusChanged {
                            previous: change.previous,
                            current: change.current,
                            message: change.message,
                        }));
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        let notifier = self.notifications_tx.clone();
        let mut settings_rx = settings.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = settings_rx.recv() => {
                        let Ok(changed) = changed else { break };
                        let _ = notifier.send(Envelope::new(NotificationBody::SettingsChanged {
                            settings: Box::new(changed),
                        }));
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Run the accept loop until shutdown
    #[cfg(unix)]
    pub async fn run(&self) -> Result<(), IpcError> {
        use tokio::net::UnixListener;

        let path = &self.config.endpoint;

        if path.exists() {
            std::fs::remove_file(path).map_err(|e| IpcError::BindError {
                endpoint: path.display().to_string(),
                reason: format!("failed to remove stale socket: {e}"),
            })?;
        }
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| IpcError::BindError {
                    endpoint: path.display().to_string(),
                    reason: format!("failed to create parent directory: {e}"),
                })?;
            }
        }

        let listener = UnixListener::bind(path).map_err(|e| IpcError::BindError {
            endpoint: path.display().to_string(),
            reason: e.to_string(),
        })?;

        // Owner-only: the transport provides the per-user authentication
        // the protocol itself assumes.
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path, permissions) {
                warn!(error = %e, "failed to restrict socket permissions");
            }
        }

        info!(endpoint = %path.display(), "IPC server listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => self.spawn_connection(stream),
                        Err(e) => warn!(error = %e, "IPC accept failed"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("IPC server shutting down");
                    break;
                }
            }
        }

        let _ = std::fs::remove_file(path);
        Ok(())
    }

    /// Run the accept loop until shutdown
    #[cfg(windows)]
    pub async fn run(&self) -> Result<(), IpcError> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let name = self.config.endpoint.to_string_lossy().into_owned();
        let mut server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&name)
            .map_err(|e| IpcError::BindError {
                endpoint: name.clone(),
                reason: e.to_string(),
            })?;

        info!(endpoint = %name, "IPC server listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = server.connect() => {
                    if let Err(e) = result {
                        warn!(error = %e, "IPC pipe connect failed");
                        continue;
                    }
                    let next = ServerOptions::new().create(&name).map_err(|e| IpcError::BindError {
                        endpoint: name.clone(),
                        reason: e.to_string(),
                    })?;
                    let stream = std::mem::replace(&mut server, next);
                    self.spawn_connection(stream);
                }
                _ = shutdown_rx.recv() => {
                    info!("IPC server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    fn spawn_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = Arc::clone(&self.handler);
        let notifications = self.notifications_tx.subscribe();
        let shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, handler, notifications, shutdown).await {
                debug!(error = %e, "IPC connection terminated");
            }
        });
    }
}

/// Serve one client until EOF, violation or shutdown
///
/// The write half is owned by one task fed through a channel, so responses
/// and broadcast notifications are serialized per client and the read loop
/// never races a half-written frame.
async fn handle_connection<S>(
    stream: S,
    handler: Arc<IpcHandler>,
    mut notifications: broadcast::Receiver<Envelope<NotificationBody>>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), IpcError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    debug!("IPC client connected");
    let (mut reader, mut writer) = tokio::io::split(stream);

    let (out_tx, mut out_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(32);
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if writer.write_all(&frame).await.is_err() || writer.flush().await.is_err() {
                break;
            }
        }
    });

    let note_tx = out_tx.clone();
    let note_task = tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(envelope) => {
                    let Ok(frame) = encode_frame(&envelope) else { continue };
                    if note_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                // Lagged receivers drop old notifications and move on
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "notification receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let result = loop {
        let payload = tokio::select! {
            frame = read_frame(&mut reader) => {
                match frame {
                    Ok(Some(payload)) => payload,
                    Ok(None) => {
                        debug!("IPC client disconnected");
                        break Ok(());
                    }
                    Err(e) => break Err(e),
                }
            }
            _ = shutdown.recv() => break Ok(()),
        };

        let envelope: Envelope<RequestBody> = match decode_payload(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Unknown verb or malformed body: no response, the
                // connection stays up.
                debug!(error = %e, "unrecognized IPC request, ignoring");
                continue;
            }
        };

        let response = handler.handle(envelope.body).await;
        let reply = Envelope::replying_to(envelope.message_id, response);
        let frame = match encode_frame(&reply) {
            Ok(frame) => frame,
            Err(e) => break Err(e),
        };
        if out_tx.send(frame).await.is_err() {
            break Ok(());
        }
    };

    drop(out_tx);
    note_task.abort();
    let _ = writer_task.await;
    result
}

/// Read one length-prefixed payload; `None` on clean EOF
async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, IpcError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(prefix) as usize;
    if len == 0 || len > MAX_MESSAGE_SIZE {
        return Err(IpcError::framing(format!(
            "frame length {len} outside (0, {MAX_MESSAGE_SIZE}]"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Encode and write one frame
async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Client for the IPC endpoint
///
/// Used by the companion control surface and by integration tests. One
/// request per call; notifications received while waiting for the matching
/// response are skipped.
pub struct IpcClient {
    endpoint: PathBuf,
}

impl IpcClient {
    /// Create a client for the given endpoint
    #[must_use]
    pub fn new(endpoint: impl AsRef<Path>) -> Self {
        Self {
            endpoint: endpoint.as_ref().to_path_buf(),
        }
    }

    /// Create a client for the host's default endpoint
    #[must_use]
    pub fn with_default_endpoint() -> Self {
        Self::new(default_endpoint())
    }

    #[cfg(unix)]
    async fn connect(&self) -> Result<tokio::net::UnixStream, IpcError> {
        tokio::time::timeout(
            CLIENT_CONNECT_TIMEOUT,
            tokio::net::UnixStream::connect(&self.endpoint),
        )
        .await
        .map_err(|_| IpcError::ConnectionError("connect timed out".into()))?
        .map_err(|e| IpcError::ConnectionError(e.to_string()))
    }

    #[cfg(windows)]
    async fn connect(
        &self,
    ) -> Result<tokio::net::windows::named_pipe::NamedPipeClient, IpcError> {
        use tokio::net::windows::named_pipe::ClientOptions;

        let name = self.endpoint.to_string_lossy().into_owned();
        tokio::time::timeout(CLIENT_CONNECT_TIMEOUT, async {
            loop {
                match ClientOptions::new().open(&name) {
                    Ok(client) => return Ok(client),
                    // Pipe busy: all instances taken, retry shortly
                    Err(e) if e.raw_os_error() == Some(231) => {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    Err(e) => return Err(IpcError::ConnectionError(e.to_string())),
                }
            }
        })
        .await
        .map_err(|_| IpcError::ConnectionError("connect timed out".into()))?
    }

    /// Send one request and await its matching response
    pub async fn send(&self, request: RequestBody) -> Result<ResponseBody, IpcError> {
        let stream = self.connect().await?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let envelope = Envelope::new(request);
        let request_id = envelope.message_id;
        write_frame(&mut writer, &envelope).await?;

        loop {
            let Some(payload) = read_frame(&mut reader).await? else {
                return Err(IpcError::ConnectionError(
                    "connection closed before the response".into(),
                ));
            };

            match decode_payload::<Envelope<ResponseBody>>(&payload) {
                Ok(response) if response.message_id == request_id => {
                    return Ok(response.body);
                }
                // A notification or someone else's response; keep reading
                Ok(_) | Err(_) => continue,
            }
        }
    }

    /// Liveness check against the endpoint
    pub async fn ping(&self) -> Result<bool, IpcError> {
        Ok(matches!(self.send(RequestBody::Ping).await?, ResponseBody::Pong))
    }

    /// The endpoint this client dials
    #[must_use]
    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }
}
