//! Cleartext version and identity exchange, followed by cipher keying.
//!
//! Both ends send a 12-byte hello (`u32` protocol version, `u64` id or
//! nonce) before reading the other's. The server sends its highest version
//! and a fresh nonce; the agent sends the version it speaks and its MAC.

use std::fmt;

use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::cipher::{Arc4, CipherReader, CipherWriter};
use crate::error::{ProtocolError, Result};
use crate::frame::{FrameReader, FrameWriter};
use crate::types::AgentId;

/// Size of a hello on the wire.
pub const HANDSHAKE_LEN: usize = 12;

/// Highest protocol version this server speaks.
pub const SERVER_MAX_PROTOCOL_VERSION: u32 = 3;

/// Version announced by the built-in agent client.
pub const CLIENT_PROTOCOL_VERSION: u32 = 3;

/// One side's half of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub protocol_version: u32,
    pub id_or_nonce: u64,
}

impl Hello {
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut out = [0u8; HANDSHAKE_LEN];
        let mut buf = &mut out[..];
        buf.put_u32(self.protocol_version);
        buf.put_u64(self.id_or_nonce);
        out
    }

    pub fn decode(bytes: &[u8; HANDSHAKE_LEN]) -> Self {
        let mut buf = &bytes[..];
        Self {
            protocol_version: buf.get_u32(),
            id_or_nonce: buf.get_u64(),
        }
    }
}

/// Operator-provisioned secret shared with every deployed agent.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
    /// The first eight bytes are mixed with the agent id and nonce.
    pub const MIN_LEN: usize = 8;

    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() < Self::MIN_LEN {
            return Err(ProtocolError::InvalidSecret(format!(
                "need at least {} bytes, got {}",
                Self::MIN_LEN,
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// Parse a hex-encoded secret.
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| ProtocolError::InvalidSecret(format!("not valid hex: {e}")))?;
        Self::new(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Cipher key for one session: the secret with its first eight bytes
    /// XORed with the big-endian agent id and nonce.
    pub fn derive_key(&self, agent: AgentId, nonce: u64) -> Vec<u8> {
        let mut key = self.0.clone();
        let mix = agent.as_u64() ^ nonce;
        for (byte, m) in key.iter_mut().zip(mix.to_be_bytes()) {
            *byte ^= m;
        }
        key
    }

    /// Two independently keyed ciphers, one per direction.
    pub fn session_ciphers(&self, agent: AgentId, nonce: u64) -> Result<(Arc4, Arc4)> {
        let key = self.derive_key(agent, nonce);
        Ok((Arc4::new(&key)?, Arc4::new(&key)?))
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret(<{} bytes redacted>)", self.0.len())
    }
}

/// A keyed session ready for framed traffic.
pub struct Established<R, W> {
    /// Version used for every frame of the session.
    pub version: u32,
    /// Version the other side announced.
    pub peer_version: u32,
    pub agent_id: AgentId,
    pub nonce: u64,
    pub reader: FrameReader<R>,
    pub writer: FrameWriter<W>,
}

impl<R, W> fmt::Debug for Established<R, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Established")
            .field("version", &self.version)
            .field("peer_version", &self.peer_version)
            .field("agent_id", &self.agent_id)
            .finish_non_exhaustive()
    }
}

async fn exchange<R, W>(reader: &mut R, writer: &mut W, ours: Hello) -> Result<Hello>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(&ours.encode()).await?;
    writer.flush().await?;
    let mut raw = [0u8; HANDSHAKE_LEN];
    reader.read_exact(&mut raw).await?;
    Ok(Hello::decode(&raw))
}

/// Server side of the handshake with a random nonce.
pub async fn accept<R, W>(
    reader: R,
    writer: W,
    secret: &SharedSecret,
    max_version: u32,
    max_frame_length: u32,
) -> Result<Established<R, W>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let nonce = rand::random::<u64>();
    accept_with_nonce(reader, writer, secret, max_version, nonce, max_frame_length).await
}

/// Server side of the handshake with a caller-chosen nonce.
///
/// Versions of zero or above `max_version` are refused without reply.
pub async fn accept_with_nonce<R, W>(
    mut reader: R,
    mut writer: W,
    secret: &SharedSecret,
    max_version: u32,
    nonce: u64,
    max_frame_length: u32,
) -> Result<Established<R, W>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let ours = Hello {
        protocol_version: max_version,
        id_or_nonce: nonce,
    };
    let theirs = exchange(&mut reader, &mut writer, ours).await?;

    let version = theirs.protocol_version;
    if version == 0 || version > max_version {
        return Err(ProtocolError::UnsupportedVersion {
            version,
            max: max_version,
        });
    }

    let agent_id = AgentId::new(theirs.id_or_nonce);
    let (decrypt, encrypt) = secret.session_ciphers(agent_id, nonce)?;
    debug!(agent = %agent_id, version, "handshake accepted");

    Ok(Established {
        version,
        peer_version: version,
        agent_id,
        nonce,
        reader: FrameReader::new(CipherReader::new(reader, decrypt), version, max_frame_length),
        writer: FrameWriter::new(CipherWriter::new(writer, encrypt), version),
    })
}

/// Agent side of the handshake.
///
/// The agent keeps speaking `client_version` even when the server announces
/// something else; the mismatch is only logged.
pub async fn connect<R, W>(
    mut reader: R,
    mut writer: W,
    secret: &SharedSecret,
    client_version: u32,
    agent_id: AgentId,
    max_frame_length: u32,
) -> Result<Established<R, W>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let ours = Hello {
        protocol_version: client_version,
        id_or_nonce: agent_id.as_u64(),
    };
    let theirs = exchange(&mut reader, &mut writer, ours).await?;

    if theirs.protocol_version != client_version {
        warn!(
            client_version,
            server_version = theirs.protocol_version,
            "protocol version mismatch"
        );
    }

    let nonce = theirs.id_or_nonce;
    let (decrypt, encrypt) = secret.session_ciphers(agent_id, nonce)?;

    Ok(Established {
        version: client_version,
        peer_version: theirs.protocol_version,
        agent_id,
        nonce,
        reader: FrameReader::new(
            CipherReader::new(reader, decrypt),
            client_version,
            max_frame_length,
        ),
        writer: FrameWriter::new(CipherWriter::new(writer, encrypt), client_version),
    })
}
