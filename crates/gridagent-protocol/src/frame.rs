//! Framed message I/O on top of the enciphered stream.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::cipher::{CipherReader, CipherWriter};
use crate::error::{ProtocolError, Result};
use crate::header::{Header, HEADER_LEN};
use crate::messages::Message;

/// Default cap on a frame's declared length (4 MiB). Firmware images are the
/// largest legitimate frames.
pub const DEFAULT_MAX_FRAME_LENGTH: u32 = 4 * 1024 * 1024;

/// Decode one frame from the front of `data`.
///
/// Returns the message and the number of bytes it occupied, which is always
/// the header's declared length. Too little data is reported as
/// [`ProtocolError::EndOfStream`].
pub fn decode_frame(data: &[u8], version: u32, max_length: u32) -> Result<(Message, usize)> {
    let header = Header::decode(data, max_length)?;
    let length = header.length as usize;
    if data.len() < length {
        return Err(ProtocolError::EndOfStream);
    }
    let message = Message::decode(&header, &data[HEADER_LEN..length], version)?;
    Ok((message, length))
}

/// Reads whole frames. Owns the decrypting half of the session.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: CipherReader<R>,
    version: u32,
    max_frame_length: u32,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: CipherReader<R>, version: u32, max_frame_length: u32) -> Self {
        Self {
            inner,
            version,
            max_frame_length,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Read one header and its payload without decoding the payload.
    ///
    /// The length cap is checked before the payload buffer is allocated.
    pub async fn read_frame(&mut self) -> Result<(Header, Vec<u8>)> {
        let mut raw = [0u8; HEADER_LEN];
        self.inner.read_exact(&mut raw).await?;
        let header = Header::decode(&raw, self.max_frame_length)?;
        let payload = self.inner.read(header.payload_len()).await?;
        Ok((header, payload))
    }

    /// Read and decode the next message.
    ///
    /// Not cancellation safe; see [`CipherReader::read_exact`].
    pub async fn read_message(&mut self) -> Result<Message> {
        let (header, payload) = self.read_frame().await?;
        Message::decode(&header, &payload, self.version)
    }
}

/// Writes whole frames. Owns the encrypting half of the session.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: CipherWriter<W>,
    version: u32,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: CipherWriter<W>, version: u32) -> Self {
        Self { inner, version }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Encode, encipher, write and flush one message. Returns the frame size.
    pub async fn write_message(&mut self, message: &Message) -> Result<usize> {
        let frame = message.encode(self.version)?;
        self.write_frame(&frame).await?;
        Ok(frame.len())
    }

    /// Encipher and write pre-encoded frame bytes.
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.inner.write(frame).await?;
        self.inner.flush().await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::Arc4;
    use crate::error::ErrorKind;
    use crate::messages::{
        CommandGpSwitchRelay, ConfigGaTime, InfoEventLog, MessageType, NotificationGaTime,
    };
    use crate::types::Meter;
    use chrono::{TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn pipe(max: u32) -> (FrameWriter<tokio::io::DuplexStream>, FrameReader<tokio::io::DuplexStream>) {
        let (a, b) = tokio::io::duplex(1 << 16);
        let writer = FrameWriter::new(CipherWriter::new(a, Arc4::new(b"k3y").unwrap()), 2);
        let reader = FrameReader::new(CipherReader::new(b, Arc4::new(b"k3y").unwrap()), 2, max);
        (writer, reader)
    }

    #[test]
    fn decode_consumes_exactly_declared_length() {
        let first = Message::from(ConfigGaTime {
            timestamp: Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap(),
        });
        let second = Message::from(CommandGpSwitchRelay {
            meter: Meter::new(1, 77),
            relay_on: true,
        });
        let mut stream = first.encode(2).unwrap();
        let first_len = stream.len();
        stream.extend(second.encode(2).unwrap());

        let (decoded, consumed) = decode_frame(&stream, 2, DEFAULT_MAX_FRAME_LENGTH).unwrap();
        assert_eq!(decoded, first);
        assert_eq!(consumed, first_len);

        let (decoded, consumed) =
            decode_frame(&stream[consumed..], 2, DEFAULT_MAX_FRAME_LENGTH).unwrap();
        assert_eq!(decoded, second);
        assert_eq!(consumed, stream.len() - first_len);
    }

    #[test]
    fn unknown_type_id_frame() {
        let frame = [0, 0, 0, 8, 0, 0, 250, 0];
        let err = decode_frame(&frame, 3, DEFAULT_MAX_FRAME_LENGTH).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownMessageType);
    }

    #[test]
    fn truncated_frame_is_end_of_stream() {
        let frame = Message::from(CommandGpSwitchRelay {
            meter: Meter::new(1, 77),
            relay_on: true,
        })
        .encode(2)
        .unwrap();
        let err = decode_frame(&frame[..frame.len() - 1], 2, DEFAULT_MAX_FRAME_LENGTH).unwrap_err();
        assert!(matches!(err, ProtocolError::EndOfStream));
    }

    #[test]
    fn random_bytes_never_panic() {
        let mut rng = StdRng::seed_from_u64(0x6A5);
        for _ in 0..20_000 {
            let len = rng.random_range(0..96);
            let mut data = vec![0u8; len];
            rng.fill(&mut data[..]);
            // bias toward plausible headers so payload decoders get exercised
            if len >= HEADER_LEN && rng.random_bool(0.8) {
                data[..4].copy_from_slice(&(len as u32).to_be_bytes());
                data[6] = rng.random_range(0..MessageType::ALL.len() as u8 + 2);
            }
            for version in 1..=3 {
                match decode_frame(&data, version, 64) {
                    Ok((_, consumed)) => {
                        let declared = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                        assert_eq!(consumed, declared as usize);
                    }
                    Err(err) => {
                        let _ = err.kind();
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn stream_round_trip() {
        let (mut writer, mut reader) = pipe(DEFAULT_MAX_FRAME_LENGTH);
        let messages = vec![
            Message::from(NotificationGaTime {
                timestamp: Utc.with_ymd_and_hms(2022, 2, 2, 2, 2, 2).unwrap(),
            }),
            Message::from(InfoEventLog {
                timestamp: Utc.with_ymd_and_hms(2022, 2, 2, 2, 2, 3).unwrap(),
                code: 1,
                text: "boot".into(),
            }),
        ];
        for message in &messages {
            writer.write_message(message).await.unwrap();
        }
        for message in &messages {
            assert_eq!(&reader.read_message().await.unwrap(), message);
        }
    }

    #[tokio::test]
    async fn oversize_frame_rejected_before_payload() {
        let (mut writer, mut reader) = pipe(16);
        // header claims 1 MiB but no payload follows
        writer
            .write_frame(&[0x00, 0x10, 0x00, 0x00, 0, 0, 0, 0])
            .await
            .unwrap();
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::OversizeFrame {
                length: 0x0010_0000,
                max: 16
            }
        ));
    }

    #[tokio::test]
    async fn closed_stream_is_end_of_stream() {
        let (writer, mut reader) = pipe(DEFAULT_MAX_FRAME_LENGTH);
        drop(writer);
        assert!(matches!(
            reader.read_message().await,
            Err(ProtocolError::EndOfStream)
        ));
    }
}
