//! TestAgent: a simulated field agent.

use std::net::SocketAddr;

use gridagent_protocol::{
    handshake, AgentId, FrameReader, FrameWriter, Header, Message, SharedSecret,
    DEFAULT_MAX_FRAME_LENGTH,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::server::{TestError, DEFAULT_TIMEOUT};

/// The client side of one agent connection.
///
/// Reads time out after [`DEFAULT_TIMEOUT`]. A timed-out read leaves the
/// stream mid-frame, so the agent should not be read from again.
pub struct TestAgent {
    agent: AgentId,
    version: u32,
    server_version: u32,
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
}

impl TestAgent {
    /// Connect to `addr` and run the agent side of the handshake.
    pub async fn connect(
        addr: SocketAddr,
        secret: &SharedSecret,
        agent: AgentId,
        version: u32,
    ) -> Result<Self, TestError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let established = tokio::time::timeout(
            DEFAULT_TIMEOUT,
            handshake::connect(reader, writer, secret, version, agent, DEFAULT_MAX_FRAME_LENGTH),
        )
        .await
        .map_err(|_| TestError::Timeout("handshake"))??;

        Ok(Self {
            agent,
            version,
            server_version: established.peer_version,
            reader: established.reader,
            writer: established.writer,
        })
    }

    pub fn id(&self) -> AgentId {
        self.agent
    }

    /// Version this agent speaks.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Highest version the server announced.
    pub fn server_version(&self) -> u32 {
        self.server_version
    }

    pub async fn send(&mut self, message: impl Into<Message>) -> Result<(), TestError> {
        self.writer.write_message(&message.into()).await?;
        Ok(())
    }

    /// Encipher and send pre-encoded frame bytes.
    pub async fn send_raw(&mut self, frame: &[u8]) -> Result<(), TestError> {
        self.writer.write_frame(frame).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Message, TestError> {
        let message = tokio::time::timeout(DEFAULT_TIMEOUT, self.reader.read_message())
            .await
            .map_err(|_| TestError::Timeout("message from server"))??;
        Ok(message)
    }

    /// Next frame with its payload left undecoded.
    pub async fn recv_frame(&mut self) -> Result<(Header, Vec<u8>), TestError> {
        let frame = tokio::time::timeout(DEFAULT_TIMEOUT, self.reader.read_frame())
            .await
            .map_err(|_| TestError::Timeout("frame from server"))??;
        Ok(frame)
    }

    /// Wait for the server to close the connection, discarding anything
    /// still in flight. Any read error counts as closed.
    pub async fn expect_closed(&mut self) -> Result<(), TestError> {
        tokio::time::timeout(DEFAULT_TIMEOUT, async {
            loop {
                if self.reader.read_frame().await.is_err() {
                    return;
                }
            }
        })
        .await
        .map_err(|_| TestError::Timeout("connection close"))
    }

    pub async fn close(mut self) -> Result<(), TestError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
