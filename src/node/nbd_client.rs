//! Minimal NBD client used by the Node's copy workers to stream disk
//! contents into the Hub's qemu-nbd exporters over the tunneled loopback
//! ports over the Network Block Device protocol.
//!
//! Implements just enough of the fixed-newstyle handshake and the
//! `NBD_CMD_WRITE` / `NBD_CMD_DISC` data path to drive a single writable
//! export -- the copy direction this system ever needs. No TLS, no
//! structured replies; qemu-nbd's defaults match this subset.

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const NBD_MAGIC: u64 = 0x4e42444d41474943; // "NBDMAGIC"
const NBD_IHAVEOPT: u64 = 0x49484156454f5054; // "IHAVEOPT"
const NBD_OPT_EXPORT_NAME: u32 = 1;
const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
const NBD_REQUEST_MAGIC: u32 = 0x25609513;
const NBD_REPLY_MAGIC: u32 = 0x67446698;
const NBD_CMD_WRITE: u16 = 1;
const NBD_CMD_DISC: u16 = 2;

#[derive(Error, Debug)]
pub enum NbdClientError {
    #[error("io error talking to nbd export: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected handshake magic from server")]
    BadHandshake,
    #[error("server rejected write at offset {0}: reply error {1}")]
    WriteRejected(u64, u32),
}

pub struct NbdWriteClient {
    stream: TcpStream,
    handle: u64,
}

impl NbdWriteClient {
    /// Connects to `host:port` and negotiates `export_name` using the
    /// fixed-newstyle handshake (no TLS, no block-size constraints beyond
    /// what the server reports -- which the Hub's `--shared=N` exporter
    /// always accepts for straightforward sequential writes).
    pub async fn connect(host: &str, port: u16, export_name: &str) -> Result<Self, NbdClientError> {
        let mut stream = TcpStream::connect((host, port)).await?;

        let magic = stream.read_u64().await?;
        if magic != NBD_MAGIC {
            return Err(NbdClientError::BadHandshake);
        }
        let opt_magic = stream.read_u64().await?;
        if opt_magic != NBD_IHAVEOPT {
            return Err(NbdClientError::BadHandshake);
        }
        let _server_flags = stream.read_u16().await?;
        stream.write_u32(NBD_FLAG_FIXED_NEWSTYLE as u32).await?;
        stream.flush().await?;

        stream.write_u64(NBD_IHAVEOPT).await?;
        stream.write_u32(NBD_OPT_EXPORT_NAME).await?;
        stream.write_u32(export_name.len() as u32).await?;
        stream.write_all(export_name.as_bytes()).await?;
        stream.flush().await?;

        let _export_size = stream.read_u64().await?;
        let _transmission_flags = stream.read_u16().await?;
        let mut zeroes = [0u8; 124];
        stream.read_exact(&mut zeroes).await?;

        Ok(Self { stream, handle: 0 })
    }

    /// Writes `data` at `offset`, the only transmission-phase command this
    /// copy direction requires.
    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), NbdClientError> {
        self.handle = self.handle.wrapping_add(1);
        let handle = self.handle;

        self.stream.write_u32(NBD_REQUEST_MAGIC).await?;
        self.stream.write_u16(0).await?; // command flags
        self.stream.write_u16(NBD_CMD_WRITE).await?;
        self.stream.write_u64(handle).await?;
        self.stream.write_u64(offset).await?;
        self.stream.write_u32(data.len() as u32).await?;
        self.stream.write_all(data).await?;
        self.stream.flush().await?;

        let reply_magic = self.stream.read_u32().await?;
        if reply_magic != NBD_REPLY_MAGIC {
            return Err(NbdClientError::BadHandshake);
        }
        let error = self.stream.read_u32().await?;
        let _reply_handle = self.stream.read_u64().await?;
        if error != 0 {
            return Err(NbdClientError::WriteRejected(offset, error));
        }
        Ok(())
    }

    pub async fn disconnect(mut self) -> Result<(), NbdClientError> {
        self.stream.write_u32(NBD_REQUEST_MAGIC).await?;
        self.stream.write_u16(0).await?;
        self.stream.write_u16(NBD_CMD_DISC).await?;
        self.stream.write_u64(0).await?;
        self.stream.write_u64(0).await?;
        self.stream.write_u32(0).await?;
        self.stream.flush().await?;
        Ok(())
    }
}
