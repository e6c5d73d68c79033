//! Data node wire protocol.
//!
//! A request is a 4-byte ASCII command code followed by its payload. A reply
//! starts with a single status byte, `+` for success or `-` for failure, and
//! on success carries a payload whose shape depends on the command. Integers
//! are little-endian; strings carry a u16 length prefix, blobs a u32 length
//! prefix; hashes are sent as 32 raw bytes.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ManagerError, Result};
use crate::types::{ChunkHash, SyncContainer, SyncFileItem};

/// Status byte of a successful reply.
pub const REPLY_OK: u8 = b'+';
/// Status byte of a failed reply.
pub const REPLY_FAILED: u8 = b'-';

/// Largest blob accepted in a reply.
pub const MAX_BLOB_SIZE: u32 = 256 * 1024 * 1024;

/// Data node commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Create,
    Read,
    Delete,
    HardwareId,
    Join,
    Mode,
    Leave,
    Wipe,
    SnapshotCreate,
    SnapshotDelete,
    SnapshotRestore,
    SyncList,
    SyncFull,
    SyncCreate,
    SyncDelete,
    SyncMove,
    Ping,
    Size,
    Used,
}

impl Command {
    pub fn code(&self) -> &'static [u8; 4] {
        match self {
            Command::Create => b"CREA",
            Command::Read => b"READ",
            Command::Delete => b"DELE",
            Command::HardwareId => b"HWID",
            Command::Join => b"JOIN",
            Command::Mode => b"MODE",
            Command::Leave => b"LEAV",
            Command::Wipe => b"WIPE",
            Command::SnapshotCreate => b"SNCR",
            Command::SnapshotDelete => b"SNDE",
            Command::SnapshotRestore => b"SNRS",
            Command::SyncList => b"SYLS",
            Command::SyncFull => b"SYFL",
            Command::SyncCreate => b"SYCR",
            Command::SyncDelete => b"SYDE",
            Command::SyncMove => b"SYMV",
            Command::Ping => b"PING",
            Command::Size => b"SIZE",
            Command::Used => b"USED",
        }
    }

    /// Payload shape of a successful reply.
    pub fn reply_kind(&self) -> ReplyKind {
        match self {
            Command::Create => ReplyKind::Hash,
            Command::Read => ReplyKind::Blob,
            Command::HardwareId => ReplyKind::Text,
            Command::SnapshotCreate => ReplyKind::Timestamp,
            Command::SyncList => ReplyKind::SyncList,
            Command::Size | Command::Used => ReplyKind::Number,
            _ => ReplyKind::Empty,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(std::str::from_utf8(self.code()).unwrap_or("????"))
    }
}

/// Encoded request builder.
pub struct Request {
    command: Command,
    buf: BytesMut,
}

impl Request {
    pub fn new(command: Command) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(command.code());
        Self { command, buf }
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn string(mut self, value: &str) -> Result<Self> {
        let len = u16::try_from(value.len())
            .map_err(|_| ManagerError::Protocol(format!("string of {} bytes", value.len())))?;
        self.buf.put_u16_le(len);
        self.buf.put_slice(value.as_bytes());
        Ok(self)
    }

    pub fn blob(mut self, value: &[u8]) -> Result<Self> {
        let len = u32::try_from(value.len())
            .map_err(|_| ManagerError::Protocol(format!("blob of {} bytes", value.len())))?;
        self.buf.put_u32_le(len);
        self.buf.put_slice(value);
        Ok(self)
    }

    pub fn hash(mut self, hash: &ChunkHash) -> Self {
        self.buf.put_slice(hash.as_bytes());
        self
    }

    pub fn flag(mut self, value: bool) -> Self {
        self.buf.put_u8(u8::from(value));
        self
    }

    pub fn number(mut self, value: u64) -> Self {
        self.buf.put_u64_le(value);
        self
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Shape of a reply payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Empty,
    Hash,
    Blob,
    Text,
    Timestamp,
    Number,
    SyncList,
}

/// Decoded successful reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Empty,
    Hash(ChunkHash),
    Blob(Bytes),
    Text(String),
    Timestamp(DateTime<Utc>),
    Number(u64),
    SyncList(SyncContainer),
}

impl Reply {
    pub fn into_hash(self) -> Result<ChunkHash> {
        match self {
            Reply::Hash(hash) => Ok(hash),
            other => Err(unexpected("hash", &other)),
        }
    }

    pub fn into_blob(self) -> Result<Bytes> {
        match self {
            Reply::Blob(data) => Ok(data),
            other => Err(unexpected("blob", &other)),
        }
    }

    pub fn into_text(self) -> Result<String> {
        match self {
            Reply::Text(text) => Ok(text),
            other => Err(unexpected("text", &other)),
        }
    }

    pub fn into_timestamp(self) -> Result<DateTime<Utc>> {
        match self {
            Reply::Timestamp(ts) => Ok(ts),
            other => Err(unexpected("timestamp", &other)),
        }
    }

    pub fn into_number(self) -> Result<u64> {
        match self {
            Reply::Number(n) => Ok(n),
            other => Err(unexpected("number", &other)),
        }
    }

    pub fn into_sync_list(self) -> Result<SyncContainer> {
        match self {
            Reply::SyncList(container) => Ok(container),
            other => Err(unexpected("sync list", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &Reply) -> ManagerError {
    ManagerError::Protocol(format!("expected {wanted} reply, got {got:?}"))
}

fn decode_error(e: std::io::Error) -> ManagerError {
    ManagerError::Protocol(format!("truncated reply: {e}"))
}

/// Reads one reply from the stream.
pub async fn read_reply<R>(reader: &mut R, kind: ReplyKind) -> Result<Reply>
where
    R: AsyncRead + Unpin,
{
    match reader.read_u8().await.map_err(decode_error)? {
        REPLY_OK => {}
        REPLY_FAILED => return Err(ManagerError::Protocol("node reported failure".into())),
        other => {
            return Err(ManagerError::Protocol(format!(
                "unknown reply status {other:#04x}"
            )))
        }
    }

    let reply = match kind {
        ReplyKind::Empty => Reply::Empty,
        ReplyKind::Hash => Reply::Hash(read_hash(reader).await?),
        ReplyKind::Blob => Reply::Blob(read_blob(reader).await?),
        ReplyKind::Text => Reply::Text(read_string(reader).await?),
        ReplyKind::Timestamp => Reply::Timestamp(read_timestamp(reader).await?),
        ReplyKind::Number => Reply::Number(reader.read_u64_le().await.map_err(decode_error)?),
        ReplyKind::SyncList => Reply::SyncList(read_sync_list(reader).await?),
    };
    Ok(reply)
}

async fn read_hash<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ChunkHash> {
    let mut bytes = [0u8; ChunkHash::LEN];
    reader.read_exact(&mut bytes).await.map_err(decode_error)?;
    Ok(ChunkHash::from_bytes(bytes))
}

async fn read_blob<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes> {
    let len = reader.read_u32_le().await.map_err(decode_error)?;
    if len > MAX_BLOB_SIZE {
        return Err(ManagerError::Protocol(format!("blob of {len} bytes exceeds limit")));
    }
    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data).await.map_err(decode_error)?;
    Ok(Bytes::from(data))
}

async fn read_string<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let len = reader.read_u16_le().await.map_err(decode_error)?;
    let mut data = vec![0u8; usize::from(len)];
    reader.read_exact(&mut data).await.map_err(decode_error)?;
    String::from_utf8(data).map_err(|e| ManagerError::Protocol(format!("invalid string: {e}")))
}

async fn read_timestamp<R: AsyncRead + Unpin>(reader: &mut R) -> Result<DateTime<Utc>> {
    let secs = reader.read_i64_le().await.map_err(decode_error)?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| ManagerError::Protocol(format!("timestamp {secs} out of range")))
}

async fn read_sync_list<R: AsyncRead + Unpin>(reader: &mut R) -> Result<SyncContainer> {
    let snapshot_count = reader.read_u64_le().await.map_err(decode_error)?;
    let mut snapshots = Vec::with_capacity(snapshot_count.min(1024) as usize);
    for _ in 0..snapshot_count {
        snapshots.push(read_timestamp(reader).await?);
    }

    let item_count = reader.read_u64_le().await.map_err(decode_error)?;
    let mut file_items = Vec::with_capacity(item_count.min(65_536) as usize);
    for _ in 0..item_count {
        let hash = read_hash(reader).await?;
        let usage = reader.read_u16_le().await.map_err(decode_error)?;
        let size = reader.read_u32_le().await.map_err(decode_error)?;
        file_items.push(SyncFileItem { hash, usage, size });
    }

    let used = reader.read_u64_le().await.map_err(decode_error)?;
    let size = reader.read_u64_le().await.map_err(decode_error)?;
    Ok(SyncContainer {
        snapshots,
        file_items,
        used,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A successful sync list reply as a data node writes it.
    fn encode_sync_list(container: &SyncContainer) -> Bytes {
        let mut buf = BytesMut::with_capacity(33 + container.file_items.len() * 38);
        buf.put_u8(REPLY_OK);
        buf.put_u64_le(container.snapshots.len() as u64);
        for ts in &container.snapshots {
            buf.put_i64_le(ts.timestamp());
        }
        buf.put_u64_le(container.file_items.len() as u64);
        for item in &container.file_items {
            buf.put_slice(item.hash.as_bytes());
            buf.put_u16_le(item.usage);
            buf.put_u32_le(item.size);
        }
        buf.put_u64_le(container.used);
        buf.put_u64_le(container.size);
        buf.freeze()
    }

    #[test]
    fn request_layout() {
        let hash = ChunkHash::from_bytes([7; 32]);
        let bytes = Request::new(Command::SyncCreate)
            .hash(&hash)
            .string("10.0.0.2:9430")
            .unwrap()
            .freeze();
        assert_eq!(&bytes[..4], b"SYCR");
        assert_eq!(&bytes[4..36], hash.as_bytes());
        assert_eq!(&bytes[36..38], &13u16.to_le_bytes());
        assert_eq!(&bytes[38..], b"10.0.0.2:9430");
    }

    #[test]
    fn sync_list_request_carries_flag_and_index() {
        let bytes = Request::new(Command::SyncList).flag(true).number(2).freeze();
        assert_eq!(bytes.len(), 13);
        assert_eq!(bytes[4], 1);
        assert_eq!(&bytes[5..], &2u64.to_le_bytes());
    }

    #[tokio::test]
    async fn failure_status_is_an_error() {
        let mut reader: &[u8] = b"-";
        let err = read_reply(&mut reader, ReplyKind::Empty).await.unwrap_err();
        assert!(matches!(err, ManagerError::Protocol(_)));

        let mut reader: &[u8] = b"?";
        assert!(read_reply(&mut reader, ReplyKind::Empty).await.is_err());
    }

    #[tokio::test]
    async fn decodes_number_and_text() {
        let mut wire = vec![REPLY_OK];
        wire.extend_from_slice(&(1u64 << 40).to_le_bytes());
        let mut reader: &[u8] = &wire;
        let reply = read_reply(&mut reader, ReplyKind::Number).await.unwrap();
        assert_eq!(reply.into_number().unwrap(), 1 << 40);

        let mut wire = vec![REPLY_OK];
        wire.extend_from_slice(&5u16.to_le_bytes());
        wire.extend_from_slice(b"hw-01");
        let mut reader: &[u8] = &wire;
        let reply = read_reply(&mut reader, ReplyKind::Text).await.unwrap();
        assert_eq!(reply.into_text().unwrap(), "hw-01");
    }

    #[tokio::test]
    async fn truncated_payload_is_rejected() {
        let mut reader: &[u8] = &[REPLY_OK, 1, 2, 3];
        assert!(read_reply(&mut reader, ReplyKind::Hash).await.is_err());
    }

    #[tokio::test]
    async fn sync_list_decodes_what_a_node_sends() {
        let container = SyncContainer {
            snapshots: vec![Utc.timestamp_opt(1_700_000_000, 0).unwrap()],
            file_items: vec![
                SyncFileItem {
                    hash: ChunkHash::from_bytes([1; 32]),
                    usage: 2,
                    size: 4096,
                },
                SyncFileItem {
                    hash: ChunkHash::from_bytes([2; 32]),
                    usage: 1,
                    size: 10,
                },
            ],
            used: 4106,
            size: 1 << 30,
        };
        let wire = encode_sync_list(&container);
        let mut reader: &[u8] = &wire;
        let decoded = read_reply(&mut reader, ReplyKind::SyncList)
            .await
            .unwrap()
            .into_sync_list()
            .unwrap();
        assert_eq!(decoded, container);
        assert!(reader.is_empty());
    }

    #[test]
    fn reply_kinds() {
        assert_eq!(Command::Create.reply_kind(), ReplyKind::Hash);
        assert_eq!(Command::Ping.reply_kind(), ReplyKind::Empty);
        assert_eq!(Command::Used.reply_kind(), ReplyKind::Number);
        assert_eq!(Command::SyncMove.to_string(), "SYMV");
    }
}
