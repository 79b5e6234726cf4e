//! RPC plumbing
//!
//! Length-prefixed frames with a checksum carry bincode message bodies
//! between nodes. Wire integers are big-endian. The async variants run
//! on the cluster runtime; the sync variants serve blocking callers
//! like the coordination client.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::PrimaryClient;
pub use server::PrimaryServer;

use crate::error::{Error, Result};

/// Frame header: body length and checksum, big-endian
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub length: u32,
    pub checksum: u32,
}

impl FrameHeader {
    pub const SIZE: usize = 8;

    /// Refuse frames past this size; a corrupt length must not OOM us
    pub const MAX_FRAME: u32 = 256 * 1024 * 1024;

    pub fn new(body: &[u8]) -> Self {
        Self {
            length: body.len() as u32,
            checksum: crc32fast::hash(body),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Result<Self> {
        let header = Self {
            length: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
            checksum: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
        };
        if header.length > Self::MAX_FRAME {
            return Err(Error::Communication(format!(
                "frame length {} exceeds limit",
                header.length
            )));
        }
        Ok(header)
    }
}

/// Read one frame body from an async reader
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes)?;

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Communication("frame checksum mismatch".into()));
    }
    Ok(body)
}

/// Write one frame to an async writer
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let header = FrameHeader::new(body);
    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame body from a blocking reader
pub fn read_frame_sync<R: std::io::Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes)?;
    let header = FrameHeader::from_bytes(&header_bytes)?;

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body)?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Communication("frame checksum mismatch".into()));
    }
    Ok(body)
}

/// Write one frame to a blocking writer
pub fn write_frame_sync<W: std::io::Write>(writer: &mut W, body: &[u8]) -> Result<()> {
    let header = FrameHeader::new(body);
    writer.write_all(&header.to_bytes())?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_frame_round_trip() {
        let body = b"follower context".to_vec();
        let mut buf = Vec::new();
        write_frame_sync(&mut buf, &body).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_frame_sync(&mut cursor).unwrap(), body);
    }

    #[test]
    fn corrupt_frame_detected() {
        let mut buf = Vec::new();
        write_frame_sync(&mut buf, b"payload").unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0x01;

        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame_sync(&mut cursor).is_err());
    }

    #[tokio::test]
    async fn async_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), b"hello");
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut bytes = [0u8; FrameHeader::SIZE];
        bytes[0..4].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(FrameHeader::from_bytes(&bytes).is_err());
    }
}
