//! ARCFOUR stream cipher and the enciphered stream halves built on it.
//!
//! Deployed agent firmware only speaks ARCFOUR, so the key schedule and byte
//! stream are reproduced exactly. Treat it as obfuscation, not security.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};

/// Keyed ARCFOUR state.
///
/// Equality and hashing cover `(i, j, permutation)`, so two instances compare
/// equal exactly when they will produce the same keystream from here on.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Arc4 {
    i: u8,
    j: u8,
    state: [u8; 256],
}

impl Arc4 {
    /// Run the key schedule over `key`.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.is_empty() {
            return Err(ProtocolError::InvalidSecret("cipher key is empty".into()));
        }

        let mut state = [0u8; 256];
        for (index, slot) in state.iter_mut().enumerate() {
            *slot = index as u8;
        }

        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
            state.swap(i, usize::from(j));
        }

        Ok(Self { i: 0, j: 0, state })
    }

    /// XOR the next `data.len()` keystream bytes into `data`.
    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.state[usize::from(self.i)]);
            self.state.swap(usize::from(self.i), usize::from(self.j));
            let index = self.state[usize::from(self.i)].wrapping_add(self.state[usize::from(self.j)]);
            *byte ^= self.state[usize::from(index)];
        }
    }

    /// Encipher (or decipher) a copy of `data`.
    pub fn process(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.apply(&mut out);
        out
    }
}

impl fmt::Debug for Arc4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arc4")
            .field("i", &self.i)
            .field("j", &self.j)
            .finish_non_exhaustive()
    }
}

/// Read half of an enciphered stream. Owns the decrypting cipher.
#[derive(Debug)]
pub struct CipherReader<R> {
    inner: R,
    cipher: Arc4,
}

impl<R: AsyncRead + Unpin> CipherReader<R> {
    pub fn new(inner: R, cipher: Arc4) -> Self {
        Self { inner, cipher }
    }

    /// Read and decipher exactly `n` bytes.
    ///
    /// A peer that closes early yields [`ProtocolError::EndOfStream`].
    pub async fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Fill `buf` with deciphered bytes.
    ///
    /// Not cancellation safe: dropping the future after a partial read leaves
    /// the keystream out of step with the peer.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf).await?;
        self.cipher.apply(buf);
        Ok(())
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Write half of an enciphered stream. Owns the encrypting cipher.
#[derive(Debug)]
pub struct CipherWriter<W> {
    inner: W,
    cipher: Arc4,
}

impl<W: AsyncWrite + Unpin> CipherWriter<W> {
    pub fn new(inner: W, cipher: Arc4) -> Self {
        Self { inner, cipher }
    }

    /// Encipher `data` and write all of it.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let enciphered = self.cipher.process(data);
        self.inner.write_all(&enciphered).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await?;
        Ok(())
    }

    /// Flush and close the underlying stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
