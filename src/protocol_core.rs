//! Message encoding and decoding shared by the client and server
//!
//! Every message is a one-byte tag followed by a tag-specific payload.
//! Integers are big-endian `i32`, strings are a big-endian `u16` byte length
//! followed by UTF-8. Decoding reads straight from the stream and only
//! returns once the whole message, including every file byte, is buffered.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Result, SyncError};
use crate::protocol::{tag, MAX_FILE_SIZE, MAX_LIST_ENTRIES, MAX_STRING_LEN};

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Greeting { username: String },
    Goodbye,
    FileTransfer { filename: String, contents: Vec<u8> },
    FilesList(Vec<String>),
    DeletedList(Vec<String>),
    UsersList(Vec<String>),
    RelayRequest { filename: String, target: String },
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::Greeting { .. } => tag::GREETING,
            Message::Goodbye => tag::GOODBYE,
            Message::FileTransfer { .. } => tag::FILE_TRANSFER,
            Message::FilesList(_) => tag::FILES_LIST,
            Message::DeletedList(_) => tag::DELETED_LIST,
            Message::UsersList(_) => tag::USERS_LIST,
            Message::RelayRequest { .. } => tag::RELAY_REQUEST,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Greeting { .. } => "Greeting",
            Message::Goodbye => "Goodbye",
            Message::FileTransfer { .. } => "FileTransfer",
            Message::FilesList(_) => "FilesList",
            Message::DeletedList(_) => "DeletedList",
            Message::UsersList(_) => "UsersList",
            Message::RelayRequest { .. } => "RelayRequest",
        }
    }
}

fn put_string(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.len() > MAX_STRING_LEN {
        return Err(SyncError::TooLarge {
            what: "string".into(),
            size: s.len() as u64,
            max: MAX_STRING_LEN as u64,
        });
    }
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_count(buf: &mut Vec<u8>, n: usize, max: usize, what: &str) -> Result<()> {
    if n > max {
        return Err(SyncError::TooLarge {
            what: what.to_string(),
            size: n as u64,
            max: max as u64,
        });
    }
    buf.extend_from_slice(&(n as i32).to_be_bytes());
    Ok(())
}

fn put_list(buf: &mut Vec<u8>, items: &[String]) -> Result<()> {
    put_count(buf, items.len(), MAX_LIST_ENTRIES, "list")?;
    for item in items {
        put_string(buf, item)?;
    }
    Ok(())
}

/// Encode a message into one contiguous frame (tag + payload).
///
/// Limits are checked before anything is produced, so a rejected message
/// never leaves partial bytes on the wire.
pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(1 + payload_hint(msg));
    buf.push(msg.tag());
    match msg {
        Message::Greeting { username } => put_string(&mut buf, username)?,
        Message::Goodbye => {}
        Message::FileTransfer { filename, contents } => {
            put_count(&mut buf, contents.len(), MAX_FILE_SIZE, "file")?;
            put_string(&mut buf, filename)?;
            buf.extend_from_slice(contents);
        }
        Message::FilesList(items) | Message::DeletedList(items) | Message::UsersList(items) => {
            put_list(&mut buf, items)?
        }
        Message::RelayRequest { filename, target } => {
            put_string(&mut buf, filename)?;
            put_string(&mut buf, target)?;
        }
    }
    Ok(buf)
}

fn payload_hint(msg: &Message) -> usize {
    match msg {
        Message::FileTransfer { filename, contents } => 4 + 2 + filename.len() + contents.len(),
        _ => 64,
    }
}

async fn read_count<R>(r: &mut R, max: usize, what: &str) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let n = r.read_i32().await?;
    if n < 0 {
        return Err(SyncError::Protocol(format!("negative {}: {}", what, n)));
    }
    let n = n as usize;
    if n > max {
        return Err(SyncError::Protocol(format!("{} too large: {} (max: {})", what, n, max)));
    }
    Ok(n)
}

async fn read_string<R>(r: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let len = r.read_u16().await? as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes).await?;
    String::from_utf8(bytes).map_err(|_| SyncError::Protocol("string is not valid UTF-8".into()))
}

async fn read_list<R>(r: &mut R) -> Result<Vec<String>>
where
    R: AsyncRead + Unpin,
{
    let count = read_count(r, MAX_LIST_ENTRIES, "list count").await?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(read_string(r).await?);
    }
    Ok(items)
}

/// Read the next complete message from a byte stream.
///
/// End of stream before a tag is reported as `Closed`; end of stream inside
/// a message is a `Stream` error.
pub async fn read_message<R>(r: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let t = match r.read_u8().await {
        Ok(t) => t,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(SyncError::Closed),
        Err(e) => return Err(e.into()),
    };
    let msg = match t {
        tag::GREETING => Message::Greeting {
            username: read_string(r).await?,
        },
        tag::GOODBYE => Message::Goodbye,
        tag::FILE_TRANSFER => {
            let len = read_count(r, MAX_FILE_SIZE, "file length").await?;
            let filename = read_string(r).await?;
            let mut contents = vec![0u8; len];
            r.read_exact(&mut contents).await?;
            Message::FileTransfer { filename, contents }
        }
        tag::FILES_LIST => Message::FilesList(read_list(r).await?),
        tag::DELETED_LIST => Message::DeletedList(read_list(r).await?),
        tag::USERS_LIST => Message::UsersList(read_list(r).await?),
        tag::RELAY_REQUEST => Message::RelayRequest {
            filename: read_string(r).await?,
            target: read_string(r).await?,
        },
        other => return Err(SyncError::Protocol(format!("unknown message tag {}", other))),
    };
    Ok(msg)
}

/// Decode one message from an in-memory frame.
pub async fn decode(mut frame: &[u8]) -> Result<Message> {
    read_message(&mut frame).await
}

/// Check that a wire file name is one plain path component.
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('\0') || name.contains('/') || name.contains('\\') {
        return Err(SyncError::InvalidName(name.to_string()));
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(SyncError::InvalidName(name.to_string())),
    }
}

/// Join a wire file name onto a directory, refusing anything that would
/// leave it.
pub fn path_in_dir(dir: &Path, name: &str) -> Result<PathBuf> {
    validate_file_name(name)?;
    Ok(dir.join(name))
}
