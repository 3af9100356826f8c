//! Pod port-forward tunnels
//!
//! A tunnel listens on a loopback port and relays every accepted connection
//! over one shared duplex stream to a container port of a ready pod. The
//! stream is opened once per tunnel; all connections read and write it
//! concurrently.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::Portforwarder;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::pods::{PodResolver, PodSelector, PodSource, ResolveError, ResolvedPod};
use crate::settings::TunnelSettings;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("Failed to allocate a local port: {0}")]
    Allocate(#[source] io::Error),

    #[error("Failed to open stream to {pod}:{port}: {reason}")]
    StreamOpen {
        pod: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to bind 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("Tunnel task exited before it was ready")]
    StartAborted,
}

/// Ask the OS for an ephemeral loopback port.
///
/// The port is released before returning, so another process can take it
/// before the tunnel binds it.
pub fn allocate_port() -> io::Result<u16> {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Bidirectional byte channel to a pod port, shared by every connection of a tunnel
#[async_trait]
pub trait DuplexStream: Send + Sync {
    /// Read up to `buf.len()` bytes. `Ok(0)` means the remote end closed.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    async fn write_all(&self, buf: &[u8]) -> io::Result<()>;
}

/// Opens the duplex stream for a pod's container port
#[async_trait]
pub trait PodStreamOpener: Send + Sync {
    async fn open_pod_stream(
        &self,
        pod: &ResolvedPod,
        container_port: u16,
    ) -> Result<Arc<dyn DuplexStream>, TunnelError>;
}

/// [`DuplexStream`] over any async byte stream, each half behind its own lock
pub struct SplitStream<S> {
    reader: tokio::sync::Mutex<ReadHalf<S>>,
    writer: tokio::sync::Mutex<WriteHalf<S>>,
    forwarder: Mutex<Option<Portforwarder>>,
}

impl<S: AsyncRead + AsyncWrite> SplitStream<S> {
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            forwarder: Mutex::new(None),
        }
    }

    /// Keep the kube port-forwarder alive for as long as the stream; it is aborted on drop
    pub fn with_forwarder(stream: S, forwarder: Portforwarder) -> Self {
        let split = Self::new(stream);
        *split.forwarder.lock() = Some(forwarder);
        split
    }
}

impl<S> Drop for SplitStream<S> {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }
    }
}

#[async_trait]
impl<S> DuplexStream for SplitStream<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.lock().await.read(buf).await
    }

    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(buf).await?;
        writer.flush().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Starting,
    Ready,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelState::Starting => "starting",
            TunnelState::Ready => "ready",
            TunnelState::Running => "running",
            TunnelState::Stopping => "stopping",
            TunnelState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Relays one accepted client connection over the shared stream
pub struct ConnectionProxy {
    socket: TcpStream,
    peer: SocketAddr,
    stream: Arc<dyn DuplexStream>,
    chunk_size: usize,
}

impl ConnectionProxy {
    pub fn new(
        socket: TcpStream,
        peer: SocketAddr,
        stream: Arc<dyn DuplexStream>,
        chunk_size: usize,
    ) -> Self {
        Self {
            socket,
            peer,
            stream,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Pump bytes both ways until either side closes or fails.
    ///
    /// Only the client socket is closed on exit; the shared stream stays open
    /// for the other connections.
    pub async fn run(self) {
        let ConnectionProxy {
            mut socket,
            peer,
            stream,
            chunk_size,
        } = self;
        let (mut client_reader, mut client_writer) = socket.split();
        let mut from_client = vec![0u8; chunk_size];
        let mut from_remote = vec![0u8; chunk_size];

        tracing::debug!("Proxying connection from {}", peer);
        loop {
            tokio::select! {
                read = client_reader.read(&mut from_client) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = stream.write_all(&from_client[..n]).await {
                            tracing::debug!("Write to pod stream failed for {}: {}", peer, e);
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Read from {} failed: {}", peer, e);
                        break;
                    }
                },
                read = stream.read(&mut from_remote) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = client_writer.write_all(&from_remote[..n]).await {
                            tracing::debug!("Write to {} failed: {}", peer, e);
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Read from pod stream failed for {}: {}", peer, e);
                        break;
                    }
                },
            }
        }
        tracing::debug!("Connection from {} closed", peer);
    }
}

/// A running tunnel. Dropping the handle stops accepting without waiting.
pub struct TunnelHandle {
    id: Uuid,
    pod: ResolvedPod,
    container_port: u16,
    local_port: u16,
    state: Arc<Mutex<TunnelState>>,
    cancel: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl TunnelHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pod(&self) -> &ResolvedPod {
        &self.pod
    }

    pub fn container_port(&self) -> u16 {
        self.container_port
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.local_port))
    }

    pub fn state(&self) -> TunnelState {
        *self.state.lock()
    }

    /// Stop accepting connections and wait for the accept loop to exit.
    ///
    /// Connections already accepted keep draining. Calling this again is a no-op.
    pub async fn stop(&mut self) {
        let Some(task) = self.accept_task.take() else {
            return;
        };

        *self.state.lock() = TunnelState::Stopping;
        self.cancel.cancel();
        if let Err(e) = task.await {
            tracing::error!("Tunnel {} accept loop failed: {}", self.id, e);
        }
        *self.state.lock() = TunnelState::Stopped;
        tracing::info!(
            "Stopped tunnel {} (localhost:{} -> {}/{}:{})",
            self.id,
            self.local_port,
            self.pod.namespace,
            self.pod.name,
            self.container_port
        );
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Opens tunnels to pods picked by label selector
pub struct PortForwarder<S> {
    resolver: PodResolver<S>,
    opener: Arc<dyn PodStreamOpener>,
    settings: TunnelSettings,
}

impl<S: PodSource> PortForwarder<S> {
    pub fn new(source: S, opener: Arc<dyn PodStreamOpener>, settings: TunnelSettings) -> Self {
        Self {
            resolver: PodResolver::new(source),
            opener,
            settings,
        }
    }

    /// Forward a fresh loopback port to `container_port` of the ready pod matching `selector`.
    ///
    /// Returns once the local port accepts connections.
    pub async fn open_tunnel(
        &self,
        selector: &PodSelector,
        container_port: u16,
    ) -> Result<TunnelHandle, TunnelError> {
        let id = Uuid::new_v4();
        let state = Arc::new(Mutex::new(TunnelState::Starting));

        let pod = self.resolver.resolve(selector).await?;
        let local_port = allocate_port().map_err(|e| {
            tracing::error!("Failed to allocate a local port: {}", e);
            TunnelError::Allocate(e)
        })?;
        tracing::debug!(
            "Tunnel {} starting: localhost:{} -> {}/{}:{}",
            id,
            local_port,
            pod.namespace,
            pod.name,
            container_port
        );

        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = TunnelTask {
            id,
            pod: pod.clone(),
            container_port,
            local_port,
            opener: self.opener.clone(),
            state: state.clone(),
            cancel: cancel.clone(),
            accept_poll: self.settings.accept_poll(),
            chunk_size: self.settings.relay_chunk_size,
        };
        let accept_task = tokio::spawn(task.run(ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = accept_task.await;
                *state.lock() = TunnelState::Stopped;
                return Err(e);
            }
            Err(_) => {
                tracing::error!("Tunnel {} task exited before it was ready", id);
                *state.lock() = TunnelState::Stopped;
                return Err(TunnelError::StartAborted);
            }
        }

        let handle = TunnelHandle {
            id,
            pod,
            container_port,
            local_port,
            state,
            cancel,
            accept_task: Some(accept_task),
        };

        self.settings
            .probe()
            .wait_until_dialable(handle.local_addr())
            .await;

        {
            let mut state = handle.state.lock();
            if *state == TunnelState::Ready {
                *state = TunnelState::Running;
            }
        }
        tracing::info!(
            "Tunnel {} running: localhost:{} -> {}/{}:{}",
            id,
            local_port,
            handle.pod.namespace,
            handle.pod.name,
            container_port
        );
        Ok(handle)
    }
}

/// Everything the accept task owns
struct TunnelTask {
    id: Uuid,
    pod: ResolvedPod,
    container_port: u16,
    local_port: u16,
    opener: Arc<dyn PodStreamOpener>,
    state: Arc<Mutex<TunnelState>>,
    cancel: CancellationToken,
    accept_poll: Duration,
    chunk_size: usize,
}

impl TunnelTask {
    async fn run(self, ready: oneshot::Sender<Result<(), TunnelError>>) {
        let stream = match self
            .opener
            .open_pod_stream(&self.pod, self.container_port)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("Tunnel {}: {}", self.id, e);
                let _ = ready.send(Err(e));
                return;
            }
        };

        let listener = match TcpListener::bind((Ipv4Addr::LOCALHOST, self.local_port)).await {
            Ok(listener) => listener,
            Err(source) => {
                let e = TunnelError::Bind {
                    port: self.local_port,
                    source,
                };
                tracing::error!("Tunnel {}: {}", self.id, e);
                let _ = ready.send(Err(e));
                return;
            }
        };

        *self.state.lock() = TunnelState::Ready;
        if ready.send(Ok(())).is_err() {
            tracing::debug!("Tunnel {} requester went away before ready", self.id);
            return;
        }

        self.accept_loop(listener, stream).await;

        // stop() owns the Stopping -> Stopped transition
        let mut state = self.state.lock();
        if *state != TunnelState::Stopping {
            *state = TunnelState::Stopped;
        }
        tracing::debug!("Tunnel {} accept loop exited", self.id);
    }

    async fn accept_loop(&self, listener: TcpListener, stream: Arc<dyn DuplexStream>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = tokio::time::timeout(self.accept_poll, listener.accept()) => match accepted {
                    Err(_) => continue,
                    Ok(Ok((socket, peer))) => {
                        let proxy = ConnectionProxy::new(socket, peer, stream.clone(), self.chunk_size);
                        tokio::spawn(proxy.run());
                    }
                    Ok(Err(e)) => {
                        tracing::error!("Tunnel {} failed to accept: {}", self.id, e);
                        break;
                    }
                },
            }
        }
    }
}
