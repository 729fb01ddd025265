//! Individual agent session handling

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use remote_agent_shared::{
    codec::{self, FrameDecoder},
    AgentHello,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::warn;

/// Handle to send messages to a specific agent
#[derive(Clone)]
pub struct SessionHandle {
    pub device_id: String,
    pub org_id: String,
    pub addr: SocketAddr,
    writer: Arc<Mutex<WriteHalf<TcpStream>>>,
    pub connected_at: Instant,
    last_seen: Arc<Mutex<Instant>>,
}

impl SessionHandle {
    /// Send a raw JSON body to this agent
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        let encoded = codec::encode(payload)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&encoded).await?;
        Ok(())
    }

    /// Serialize `value` and send it to this agent
    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.send(&payload).await
    }

    /// Time since the agent last sent anything
    pub async fn idle_for(&self) -> std::time::Duration {
        self.last_seen.lock().await.elapsed()
    }

    async fn touch(&self) {
        *self.last_seen.lock().await = Instant::now();
    }
}

/// Active agent session
pub struct AgentSession {
    handle: SessionHandle,
    reader: ReadHalf<TcpStream>,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
}

impl AgentSession {
    /// Wrap an accepted socket and wait for the agent's hello frame
    pub async fn accept(stream: TcpStream, addr: SocketAddr) -> Result<Self> {
        let (reader, writer) = tokio::io::split(stream);
        let now = Instant::now();

        let mut session = Self {
            handle: SessionHandle {
                device_id: String::new(),
                org_id: String::new(),
                addr,
                writer: Arc::new(Mutex::new(writer)),
                connected_at: now,
                last_seen: Arc::new(Mutex::new(now)),
            },
            reader,
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; 4096],
        };

        let first = session
            .recv()
            .await
            .ok_or_else(|| anyhow!("Connection closed before hello"))?;
        let hello: AgentHello =
            serde_json::from_slice(&first).context("First frame was not a hello")?;
        if hello.device_id.is_empty() {
            return Err(anyhow!("Hello without device_id"));
        }

        session.handle.device_id = hello.device_id;
        session.handle.org_id = hello.org_id;
        Ok(session)
    }

    /// Get a cloneable handle for sending messages
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Read the next message body from this session
    /// Returns None if the connection is closed
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.decoder.decode_next() {
                Ok(Some(frame)) => {
                    self.handle.touch().await;
                    return Some(frame);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Decode error from {}: {}", self.handle.addr, e);
                    return None;
                }
            }

            match self.reader.read(&mut self.read_buf).await {
                Ok(0) => return None,
                Ok(n) => self.decoder.extend(&self.read_buf[..n]),
                Err(e) => {
                    warn!("Read error from {}: {}", self.handle.addr, e);
                    return None;
                }
            }
        }
    }

    pub fn device_id(&self) -> &str {
        &self.handle.device_id
    }
}
