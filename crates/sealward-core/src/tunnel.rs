//! Ephemeral local tunnels into a pod port.
//!
//! A [`Tunnel`] binds a local listener on `127.0.0.1` and forwards every
//! accepted connection to the pod through a [`PodDialer`]. It is owned by the
//! operation that opened it, closed on every exit path (explicitly through
//! [`Tunnel::close`], or by `Drop` on early return and unwind), and never
//! reused across pipeline stages.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::PodRef;
use crate::config::{LocalPort, ToolkitConfig};
use crate::error::TunnelError;

/// A bidirectional byte stream into a pod port.
///
/// `guard` keeps whatever owns the underlying transport (a port-forwarder, an
/// attached exec process) alive for as long as the stream is.
pub struct PodStream {
    reader: Pin<Box<dyn AsyncRead + Send>>,
    writer: Pin<Box<dyn AsyncWrite + Send>>,
    _guard: Option<Box<dyn Send>>,
}

impl PodStream {
    /// Wrap a single duplex stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(reader, writer)
    }

    /// Join separate read and write halves (e.g. process stdout/stdin).
    pub fn from_parts<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self {
            reader: Box::pin(reader),
            writer: Box::pin(writer),
            _guard: None,
        }
    }

    /// Keep `guard` alive until the stream is dropped.
    #[must_use]
    pub fn with_guard(self, guard: impl Send + 'static) -> Self {
        Self {
            _guard: Some(Box::new(guard)),
            ..self
        }
    }
}

impl AsyncRead for PodStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut().reader.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for PodStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().writer.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().writer.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().writer.as_mut().poll_shutdown(cx)
    }
}

/// Opens byte streams to a port inside a pod.
#[async_trait]
pub trait PodDialer: Send + Sync {
    async fn dial(&self, pod: &PodRef, port: u16) -> Result<PodStream, TunnelError>;
}

fn kube_dial_error(pod: &PodRef, port: u16, err: kube::Error) -> TunnelError {
    match err {
        kube::Error::UpgradeConnection(e) => TunnelError::Upgrade {
            pod: pod.name.clone(),
            reason: e.to_string(),
        },
        other => TunnelError::Dial {
            pod: pod.name.clone(),
            port,
            reason: other.to_string(),
        },
    }
}

/// Dials through the pod `portforward` subresource over WebSocket.
#[derive(Clone)]
pub struct PortForwardDialer {
    client: Client,
}

impl PortForwardDialer {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodDialer for PortForwardDialer {
    async fn dial(&self, pod: &PodRef, port: u16) -> Result<PodStream, TunnelError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let mut forwarder = pods
            .portforward(&pod.name, &[port])
            .await
            .map_err(|e| kube_dial_error(pod, port, e))?;

        let stream = forwarder.take_stream(port).ok_or_else(|| TunnelError::Dial {
            pod: pod.name.clone(),
            port,
            reason: "port-forward returned no stream for port".to_owned(),
        })?;

        debug!(pod = %pod.name, port, "port-forward stream established");
        Ok(PodStream::new(stream).with_guard(forwarder))
    }
}

/// Dials by exec-ing `nc` in the pod's first container and bridging its
/// stdio. Works where the port-forward subresource is unavailable.
#[derive(Clone)]
pub struct ExecDialer {
    client: Client,
}

impl ExecDialer {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodDialer for ExecDialer {
    async fn dial(&self, pod: &PodRef, port: u16) -> Result<PodStream, TunnelError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let mut params = AttachParams::default().stdin(true).stdout(true).stderr(false);
        if let Some(container) = &pod.container_name {
            params = params.container(container.clone());
        }

        let command = vec!["nc".to_owned(), "127.0.0.1".to_owned(), port.to_string()];
        let mut process = pods
            .exec(&pod.name, command, &params)
            .await
            .map_err(|e| kube_dial_error(pod, port, e))?;

        let missing = |what: &str| TunnelError::Dial {
            pod: pod.name.clone(),
            port,
            reason: format!("exec session has no {what}"),
        };
        let stdin = process.stdin().ok_or_else(|| missing("stdin"))?;
        let stdout = process.stdout().ok_or_else(|| missing("stdout"))?;

        debug!(pod = %pod.name, port, "exec stream established");
        Ok(PodStream::from_parts(stdout, stdin).with_guard(process))
    }
}

/// Tries `primary`, switching to `fallback` only when the primary transport
/// could not be negotiated.
pub struct FallbackDialer {
    primary: Arc<dyn PodDialer>,
    fallback: Arc<dyn PodDialer>,
}

impl FallbackDialer {
    #[must_use]
    pub fn new(primary: Arc<dyn PodDialer>, fallback: Arc<dyn PodDialer>) -> Self {
        Self { primary, fallback }
    }

    /// Port-forward first, exec bridge on upgrade failure.
    #[must_use]
    pub fn kubernetes(client: &Client) -> Self {
        Self::new(
            Arc::new(PortForwardDialer::new(client.clone())),
            Arc::new(ExecDialer::new(client.clone())),
        )
    }
}

#[async_trait]
impl PodDialer for FallbackDialer {
    async fn dial(&self, pod: &PodRef, port: u16) -> Result<PodStream, TunnelError> {
        match self.primary.dial(pod, port).await {
            Err(e) if e.is_upgrade_failure() => {
                warn!(pod = %pod.name, error = %e, "falling back to legacy transport");
                self.fallback.dial(pod, port).await
            }
            other => other,
        }
    }
}

/// Opens tunnels with a configured dialer and local port policy.
#[derive(Clone)]
pub struct TunnelManager {
    dialer: Arc<dyn PodDialer>,
    local_port: LocalPort,
    ready_timeout: Duration,
}

impl TunnelManager {
    #[must_use]
    pub fn new(dialer: Arc<dyn PodDialer>, config: &ToolkitConfig) -> Self {
        Self {
            dialer,
            local_port: config.local_port,
            ready_timeout: config.tunnel_ready_timeout,
        }
    }

    /// Open a tunnel to the pod's first declared container port.
    ///
    /// Returns once the forwarding task has established its first stream.
    /// Cancelling `cancel` stops the tunnel.
    ///
    /// # Errors
    ///
    /// `PodNotRunning` for a pod that is not `Running`, `NoContainerPort`,
    /// `Bind`, any dial error, `ReadyTimeout`, or `Cancelled`.
    pub async fn open(
        &self,
        cancel: &CancellationToken,
        pod: &PodRef,
    ) -> Result<Tunnel, TunnelError> {
        if !pod.is_running() {
            return Err(TunnelError::PodNotRunning {
                pod: pod.name.clone(),
                phase: pod.phase.to_string(),
            });
        }
        let remote_port = pod.container_port.ok_or_else(|| TunnelError::NoContainerPort {
            pod: pod.name.clone(),
        })?;

        let port = self.local_port.bind_port();
        let bind_error = |e: io::Error| TunnelError::Bind {
            port,
            reason: e.to_string(),
        };
        let listener = TcpListener::bind(("127.0.0.1", port)).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let stop = cancel.child_token();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (health_tx, health_rx) = watch::channel(None);

        let task = tokio::spawn(forward(
            listener,
            Arc::clone(&self.dialer),
            pod.clone(),
            remote_port,
            stop.clone(),
            ready_tx,
            health_tx,
        ));

        let mut tunnel = Tunnel {
            pod: pod.clone(),
            local_addr,
            remote_port,
            stop,
            health: health_rx,
            task: Some(task),
        };

        let outcome = tokio::select! {
            () = cancel.cancelled() => Err(TunnelError::Cancelled { pod: pod.name.clone() }),
            ready = tokio::time::timeout(self.ready_timeout, ready_rx) => match ready {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(TunnelError::Forwarding {
                    pod: pod.name.clone(),
                    reason: "forwarding task exited before signalling readiness".to_owned(),
                }),
                Err(_) => Err(TunnelError::ReadyTimeout {
                    pod: pod.name.clone(),
                    timeout: self.ready_timeout,
                }),
            },
        };

        match outcome {
            Ok(()) => {
                info!(
                    pod = %pod.name,
                    namespace = %pod.namespace,
                    local = %local_addr,
                    remote_port,
                    "tunnel ready"
                );
                Ok(tunnel)
            }
            Err(e) => {
                tunnel.shutdown().await;
                Err(e)
            }
        }
    }
}

/// Forwarding loop owned by a tunnel.
///
/// Readiness means the transport works: the first stream is dialed up front
/// and handed to the first accepted connection. Later connections dial inside
/// their own task, so a stalled dial never blocks accepting or stopping.
async fn forward(
    listener: TcpListener,
    dialer: Arc<dyn PodDialer>,
    pod: PodRef,
    remote_port: u16,
    stop: CancellationToken,
    ready: oneshot::Sender<Result<(), TunnelError>>,
    health: watch::Sender<Option<TunnelError>>,
) {
    let mut spare = match dialer.dial(&pod, remote_port).await {
        Ok(stream) => Some(stream),
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let health = Arc::new(health);
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        let _ = health.send(Some(TunnelError::Forwarding {
                            pod: pod.name.clone(),
                            reason: e.to_string(),
                        }));
                        break;
                    }
                };
                debug!(pod = %pod.name, %peer, "forwarding connection");
                connections.spawn(connection(
                    socket,
                    spare.take(),
                    Arc::clone(&dialer),
                    pod.clone(),
                    remote_port,
                    stop.clone(),
                    Arc::clone(&health),
                ));
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    connections.shutdown().await;
    debug!(pod = %pod.name, "forwarding loop stopped");
}

/// Serve one accepted connection, dialing a fresh stream unless one was
/// handed over.
async fn connection(
    socket: TcpStream,
    dialed: Option<PodStream>,
    dialer: Arc<dyn PodDialer>,
    pod: PodRef,
    remote_port: u16,
    stop: CancellationToken,
    health: Arc<watch::Sender<Option<TunnelError>>>,
) {
    let stream = match dialed {
        Some(stream) => stream,
        None => {
            let dialed = tokio::select! {
                () = stop.cancelled() => return,
                dialed = dialer.dial(&pod, remote_port) => dialed,
            };
            match dialed {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(pod = %pod.name, error = %e, "dial failed for accepted connection");
                    let _ = health.send(Some(e));
                    return;
                }
            }
        }
    };
    pipe(socket, stream, stop).await;
}

async fn pipe(mut socket: TcpStream, mut stream: PodStream, stop: CancellationToken) {
    tokio::select! {
        () = stop.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut socket, &mut stream) => {
            if let Err(e) = result {
                debug!(error = %e, "connection closed with error");
            }
        }
    }
}

/// An open tunnel. Cancelled when dropped.
pub struct Tunnel {
    pod: PodRef,
    local_addr: SocketAddr,
    remote_port: u16,
    stop: CancellationToken,
    health: watch::Receiver<Option<TunnelError>>,
    task: Option<JoinHandle<()>>,
}

impl Tunnel {
    #[must_use]
    pub fn pod(&self) -> &PodRef {
        &self.pod
    }

    /// Local address clients connect to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// The first failure reported by the forwarding loop, if any.
    ///
    /// # Errors
    ///
    /// Returns the recorded forwarding error.
    pub fn health(&self) -> Result<(), TunnelError> {
        match &*self.health.borrow() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Stop forwarding and wait for the loop to exit. Safe to call again.
    ///
    /// # Errors
    ///
    /// Returns a forwarding failure recorded while the tunnel was open.
    pub async fn close(&mut self) -> Result<(), TunnelError> {
        if self.task.is_some() {
            self.shutdown().await;
            debug!(pod = %self.pod.name, local = %self.local_addr, "tunnel closed");
        }
        self.health()
    }

    async fn shutdown(&mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
