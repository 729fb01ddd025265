//! Connection manager with a persistent hub connection and automatic reconnection

use super::outbound::Outbound;
use crate::transport::{TransportConnector, TransportStream};
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use remote_agent_shared::{
    codec::{self, FrameDecoder},
    intervals, AgentHello,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outbound frames buffered while the hub is slow or unreachable
const OUTBOUND_QUEUE_DEPTH: usize = 100;

/// Events emitted by the connection manager
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// (Re)connected to the hub
    Connected { transport: &'static str },
    /// Lost the hub connection; a reconnect follows
    Disconnected { reason: String },
    /// Received a message body from the hub
    Received(Bytes),
    /// A reconnect attempt failed; another follows after backoff
    ConnectionFailed { reason: String },
}

/// Configuration for connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Device ID announced to the hub
    pub device_id: String,
    /// Organization announced to the hub
    pub org_id: String,
    /// Reconnection delay (initial)
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay
    pub max_reconnect_delay: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            device_id: "agent-001".into(),
            org_id: String::new(),
            reconnect_delay: Duration::from_millis(intervals::RECONNECT_DELAY_MS),
            max_reconnect_delay: Duration::from_millis(intervals::MAX_RECONNECT_DELAY_MS),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Owns the hub connection for the lifetime of the agent
pub struct ConnectionManager {
    config: ConnectionConfig,
    outbound: Outbound,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl ConnectionManager {
    /// Connect to the hub and start the connection loop
    ///
    /// Only this first attempt can fail; later connection losses are retried
    /// in the background with exponential backoff.
    pub async fn connect<C: TransportConnector>(
        config: ConnectionConfig,
        connector: C,
    ) -> Result<Self> {
        let stream = timeout(config.connect_timeout, connector.connect())
            .await
            .map_err(|_| anyhow!("Timed out connecting via {}", connector.name()))?
            .with_context(|| format!("Failed to connect via {}", connector.name()))?;

        let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::unbounded_channel::<ConnectionEvent>();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(connection_loop(
            config.clone(),
            connector,
            stream,
            outbound_rx,
            event_tx,
            cancel.clone(),
        ));

        Ok(Self {
            config,
            outbound: Outbound::new(outbound_tx),
            event_rx,
            cancel,
            task,
        })
    }

    /// Queue a message body for the hub
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        self.outbound.send(payload).await
    }

    /// Get a clone of the sender for outbound messages
    pub fn sender(&self) -> Outbound {
        self.outbound.clone()
    }

    /// Receive the next connection event
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.event_rx.recv().await
    }

    /// Get the device ID
    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    /// Flush queued messages and close the connection
    ///
    /// Returns an error if the queued messages could not be written.
    pub async fn disconnect(self) -> Result<()> {
        self.cancel.cancel();
        self.task
            .await
            .map_err(|e| anyhow!("Connection task failed: {}", e))?
    }
}

/// Main connection loop with reconnection logic
async fn connection_loop<C: TransportConnector>(
    config: ConnectionConfig,
    connector: C,
    initial: C::Stream,
    mut outbound_rx: mpsc::Receiver<Bytes>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut next = Some(initial);
    let mut reconnect_delay = config.reconnect_delay;
    // Frame taken off the queue whose write failed; written first on reconnect
    let mut held: Option<Bytes> = None;

    loop {
        let stream = match next.take() {
            Some(stream) => stream,
            None => {
                let attempt = tokio::select! {
                    _ = cancel.cancelled() => {
                        discard_held(held);
                        return Ok(());
                    }
                    attempt = timeout(config.connect_timeout, connector.connect()) => attempt,
                };

                let reason = match attempt {
                    Ok(Ok(stream)) => {
                        next = Some(stream);
                        continue;
                    }
                    Ok(Err(e)) => format!("{} connect failed: {}", connector.name(), e),
                    Err(_) => format!("{} connect timed out", connector.name()),
                };

                let _ = event_tx.send(ConnectionEvent::ConnectionFailed { reason });
                if !backoff(&cancel, &mut reconnect_delay, config.max_reconnect_delay).await {
                    discard_held(held);
                    return Ok(());
                }
                continue;
            }
        };

        reconnect_delay = config.reconnect_delay;
        let _ = event_tx.send(ConnectionEvent::Connected {
            transport: connector.name(),
        });

        let outcome = handle_connection(
            stream,
            &config,
            &mut outbound_rx,
            &mut held,
            &event_tx,
            &cancel,
        )
        .await;

        match outcome {
            Ok(()) => {
                info!("Hub connection closed");
                return Ok(());
            }
            Err(e) if cancel.is_cancelled() => {
                discard_held(held);
                return Err(e);
            }
            Err(e) => {
                let _ = event_tx.send(ConnectionEvent::Disconnected {
                    reason: e.to_string(),
                });
                if !backoff(&cancel, &mut reconnect_delay, config.max_reconnect_delay).await {
                    discard_held(held);
                    return Ok(());
                }
            }
        }
    }
}

fn discard_held(held: Option<Bytes>) {
    if let Some(payload) = held {
        warn!(
            "Dropping undelivered outbound message ({} bytes) at shutdown",
            payload.len()
        );
    }
}

/// Sleep for the current delay and double it. Returns false if cancelled.
async fn backoff(cancel: &CancellationToken, delay: &mut Duration, max: Duration) -> bool {
    let wait = *delay;
    *delay = std::cmp::min(*delay * 2, max);

    debug!("Reconnecting in {:?}", wait);
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}

/// Handle an active connection
///
/// Returns `Ok` on a clean stop (cancelled and flushed) and `Err` when the
/// connection was lost.
async fn handle_connection<S: TransportStream>(
    stream: S,
    config: &ConnectionConfig,
    outbound_rx: &mut mpsc::Receiver<Bytes>,
    held: &mut Option<Bytes>,
    event_tx: &mpsc::UnboundedSender<ConnectionEvent>,
    cancel: &CancellationToken,
) -> Result<()> {
    let (mut reader, mut writer) = tokio::io::split(stream);

    let hello = AgentHello {
        device_id: config.device_id.clone(),
        org_id: config.org_id.clone(),
    };
    writer
        .write_all(&codec::encode_json(&hello)?)
        .await
        .context("Failed to send hello")?;

    if let Some(payload) = held.take() {
        info!("Resending message held from the previous connection");
        if let Err(e) = write_frame(&mut writer, &payload).await {
            *held = Some(payload);
            return Err(e);
        }
    }

    let mut decoder = FrameDecoder::new();
    let mut read_buf = vec![0u8; 4096];

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break flush_pending(&mut writer, outbound_rx).await;
            }

            maybe = outbound_rx.recv() => {
                match maybe {
                    Some(payload) => {
                        if let Err(e) = write_frame(&mut writer, &payload).await {
                            warn!(
                                "Write failed, holding {} byte message for the next connection",
                                payload.len()
                            );
                            *held = Some(payload);
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                }
            }

            result = reader.read(&mut read_buf) => {
                match result {
                    Ok(0) => break Err(anyhow!("Hub closed connection")),
                    Ok(n) => {
                        decoder.extend(&read_buf[..n]);
                        if let Err(e) = drain_frames(&mut decoder, event_tx) {
                            break Err(e);
                        }
                    }
                    Err(e) => break Err(anyhow!("Read error: {}", e)),
                }
            }
        }
    };

    let mut stream = reader.unsplit(writer);
    if outcome.is_ok() {
        TransportStream::shutdown(&mut stream).await?;
    }
    outcome
}

/// Write everything still queued, refusing new messages
async fn flush_pending<W: AsyncWrite + Unpin>(
    writer: &mut W,
    outbound_rx: &mut mpsc::Receiver<Bytes>,
) -> Result<()> {
    outbound_rx.close();
    while let Some(payload) = outbound_rx.recv().await {
        write_frame(writer, &payload).await?;
    }
    writer.flush().await.context("Flush error")?;
    Ok(())
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let frame = match codec::encode(payload) {
        Ok(frame) => frame,
        Err(e) => {
            // Oversized payloads are dropped; the connection itself is fine
            error!("Dropping outbound message: {}", e);
            return Ok(());
        }
    };
    writer.write_all(&frame).await.context("Write error")?;
    Ok(())
}

fn drain_frames(
    decoder: &mut FrameDecoder,
    event_tx: &mpsc::UnboundedSender<ConnectionEvent>,
) -> Result<()> {
    while let Some(payload) = decoder.decode_next()? {
        let _ = event_tx.send(ConnectionEvent::Received(payload));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpConnector;
    use async_trait::async_trait;
    use std::pin::Pin;
    use std::task::{Context as TaskContext, Poll};
    use tokio::io::{AsyncRead, DuplexStream, ReadBuf};
    use tokio::net::{TcpListener, TcpStream};

    /// In-memory stream whose writes start failing after `writes_left`
    struct FlakyStream {
        inner: DuplexStream,
        writes_left: usize,
    }

    impl AsyncRead for FlakyStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut TaskContext<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for FlakyStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut TaskContext<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            if self.writes_left == 0 {
                return Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
            }
            self.writes_left -= 1;
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(
            mut self: Pin<&mut Self>,
            cx: &mut TaskContext<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut TaskContext<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    #[async_trait]
    impl TransportStream for FlakyStream {
        async fn shutdown(&mut self) -> Result<()> {
            AsyncWriteExt::shutdown(&mut self.inner).await?;
            Ok(())
        }
    }

    async fn read_duplex_frames(mut peer: DuplexStream) -> Vec<Bytes> {
        let mut all = Vec::new();
        peer.read_to_end(&mut all).await.unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.extend(&all);
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode_next().unwrap() {
            frames.push(frame);
        }
        frames
    }

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            device_id: "agent-test".into(),
            org_id: "org-test".into(),
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(2),
        }
    }

    async fn read_frame(socket: &mut TcpStream, decoder: &mut FrameDecoder) -> Option<Bytes> {
        let mut buf = vec![0u8; 1024];
        loop {
            if let Some(frame) = decoder.decode_next().unwrap() {
                return Some(frame);
            }
            match socket.read(&mut buf).await.unwrap() {
                0 => return None,
                n => decoder.extend(&buf[..n]),
            }
        }
    }

    async fn next_received(conn: &mut ConnectionManager) -> Bytes {
        loop {
            match conn.recv().await.expect("event stream closed") {
                ConnectionEvent::Received(payload) => return payload,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_hello_then_bidirectional_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let mut conn = ConnectionManager::connect(test_config(), TcpConnector::new(&addr))
            .await
            .unwrap();
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut decoder = FrameDecoder::new();

        let hello = read_frame(&mut socket, &mut decoder).await.unwrap();
        let hello: AgentHello = serde_json::from_slice(&hello).unwrap();
        assert_eq!(hello.device_id, "agent-test");
        assert_eq!(hello.org_id, "org-test");

        conn.send(Bytes::from_static(br#"{"cpu_usage":1.0}"#))
            .await
            .unwrap();
        let frame = read_frame(&mut socket, &mut decoder).await.unwrap();
        assert_eq!(&frame[..], br#"{"cpu_usage":1.0}"#);

        socket
            .write_all(&codec::encode(br#"{"commands":"ls"}"#).unwrap())
            .await
            .unwrap();
        let received = next_received(&mut conn).await;
        assert_eq!(&received[..], br#"{"commands":"ls"}"#);
    }

    #[tokio::test]
    async fn test_initial_connect_failure_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = ConnectionManager::connect(test_config(), TcpConnector::new(&addr)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_flushes_queued_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let conn = ConnectionManager::connect(test_config(), TcpConnector::new(&addr))
            .await
            .unwrap();
        let (mut socket, _) = listener.accept().await.unwrap();

        for i in 0..3 {
            conn.send(Bytes::from(format!(r#"{{"n":{}}}"#, i)))
                .await
                .unwrap();
        }
        conn.disconnect().await.unwrap();

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        while let Some(frame) = read_frame(&mut socket, &mut decoder).await {
            frames.push(frame);
        }

        // hello + three queued messages, then EOF
        assert_eq!(frames.len(), 4);
        assert_eq!(&frames[3][..], br#"{"n":2}"#);
    }

    #[tokio::test]
    async fn test_reconnects_after_hub_drops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let mut conn = ConnectionManager::connect(test_config(), TcpConnector::new(&addr))
            .await
            .unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);

        loop {
            if let ConnectionEvent::Disconnected { .. } = conn.recv().await.unwrap() {
                break;
            }
        }

        let (mut socket, _) = listener.accept().await.unwrap();
        let mut decoder = FrameDecoder::new();
        let hello = read_frame(&mut socket, &mut decoder).await.unwrap();
        let hello: AgentHello = serde_json::from_slice(&hello).unwrap();
        assert_eq!(hello.device_id, "agent-test");
    }

    #[tokio::test]
    async fn test_failed_write_is_resent_after_reconnect() {
        let config = test_config();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let (tx, mut outbound_rx) = mpsc::channel(4);
        let mut held = None;

        // Hello goes through, the result write fails
        let (stream, _peer) = tokio::io::duplex(64 * 1024);
        let flaky = FlakyStream {
            inner: stream,
            writes_left: 1,
        };
        tx.send(Bytes::from_static(br#"{"result":1}"#)).await.unwrap();
        let cancel = CancellationToken::new();
        let outcome =
            handle_connection(flaky, &config, &mut outbound_rx, &mut held, &event_tx, &cancel)
                .await;
        assert!(outcome.is_err());
        assert_eq!(held.as_deref(), Some(&br#"{"result":1}"#[..]));

        // The next connection writes it right after the hello
        let (stream, peer) = tokio::io::duplex(64 * 1024);
        let healthy = FlakyStream {
            inner: stream,
            writes_left: usize::MAX,
        };
        cancel.cancel();
        handle_connection(healthy, &config, &mut outbound_rx, &mut held, &event_tx, &cancel)
            .await
            .unwrap();
        assert!(held.is_none());

        let frames = read_duplex_frames(peer).await;
        assert_eq!(frames.len(), 2);
        let hello: AgentHello = serde_json::from_slice(&frames[0]).unwrap();
        assert_eq!(hello.device_id, "agent-test");
        assert_eq!(&frames[1][..], br#"{"result":1}"#);
    }
}
