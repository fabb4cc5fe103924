//! Wire format
//!
//! A request is one 128-byte frame holding comma-separated ASCII fields,
//! padded with NULs or spaces. A response is a 128-byte header containing
//! `"<length>,"` left-justified and space-padded, followed by exactly
//! `length` payload bytes. A length of `-1` means "not found" and carries no
//! payload.

use crate::error::{NetcacheError, Result};
use netcache_store::{validate_artifact_name, validate_key};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_SIZE: usize = 128;

/// Length sent in place of a payload size when an artifact is missing
pub const NOT_FOUND: i64 = -1;

pub type Frame = [u8; HEADER_SIZE];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Store {
        key: String,
        artifact: String,
        size: u64,
    },
    Fetch {
        key: String,
        artifact: String,
    },
    Reclaim,
    Reset,
    Stats,
    Close,
}

fn is_padding(c: char) -> bool {
    c == '\0' || c.is_whitespace()
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::List => "LIST",
            Command::Store { .. } => "STORE",
            Command::Fetch { .. } => "FETCH",
            Command::Reclaim => "RECLAIM",
            Command::Reset => "RESET",
            Command::Stats => "STATS",
            Command::Close => "CLOSE",
        }
    }

    /// Decode one request frame. Legacy waf verbs (`LST`, `PUT`, `GET`,
    /// `CLN`, `RST`, `BYE`) are accepted as aliases.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(frame)
            .ok()
            .filter(|t| t.is_ascii())
            .ok_or_else(|| NetcacheError::Protocol("frame is not ASCII".to_string()))?;

        let mut fields: Vec<&str> = text
            .trim_matches(is_padding)
            .split(',')
            .map(|f| f.trim_matches(is_padding))
            .collect();
        while fields.len() > 1 && fields.last().is_some_and(|f| f.is_empty()) {
            fields.pop();
        }

        let (name, args) = match fields.split_first() {
            Some((name, args)) if !name.is_empty() => (*name, args),
            _ => return Err(NetcacheError::Protocol("empty command".to_string())),
        };

        let command = match name {
            "LIST" | "LST" => Command::List,
            "STORE" | "PUT" => {
                let [key, artifact, size] = expect_args::<3>(name, args)?;
                let size = size.parse::<u64>().map_err(|_| {
                    NetcacheError::Protocol(format!("invalid declared size {:?}", size))
                })?;
                Command::Store {
                    key: checked_key(key)?,
                    artifact: checked_artifact(artifact)?,
                    size,
                }
            }
            "FETCH" | "GET" => {
                let [key, artifact] = expect_args::<2>(name, args)?;
                Command::Fetch {
                    key: checked_key(key)?,
                    artifact: checked_artifact(artifact)?,
                }
            }
            "RECLAIM" | "CLN" | "CLEAN" => Command::Reclaim,
            "RESET" | "RST" => Command::Reset,
            "STATS" => Command::Stats,
            "CLOSE" | "BYE" => Command::Close,
            other => {
                return Err(NetcacheError::Protocol(format!(
                    "unknown command {:?}",
                    other
                )))
            }
        };

        if matches!(command, Command::Store { .. } | Command::Fetch { .. }) || args.is_empty() {
            Ok(command)
        } else {
            Err(NetcacheError::Protocol(format!(
                "{} takes no arguments",
                command.name()
            )))
        }
    }

    /// Encode as a request frame, the inverse of [`Command::parse`]
    pub fn to_frame(&self) -> Result<Frame> {
        let text = match self {
            Command::Store {
                key,
                artifact,
                size,
            } => format!("STORE,{},{},{}", key, artifact, size),
            Command::Fetch { key, artifact } => format!("FETCH,{},{}", key, artifact),
            other => other.name().to_string(),
        };
        pad_frame(&text)
    }
}

fn expect_args<'a, const N: usize>(name: &str, args: &[&'a str]) -> Result<[&'a str; N]> {
    <[&str; N]>::try_from(args).map_err(|_| {
        NetcacheError::Protocol(format!(
            "{} expects {} arguments, got {}",
            name,
            N,
            args.len()
        ))
    })
}

fn checked_key(key: &str) -> Result<String> {
    validate_key(key).map_err(|e| NetcacheError::Protocol(e.to_string()))?;
    Ok(key.to_string())
}

fn checked_artifact(artifact: &str) -> Result<String> {
    validate_artifact_name(artifact).map_err(|e| NetcacheError::Protocol(e.to_string()))?;
    Ok(artifact.to_string())
}

fn pad_frame(text: &str) -> Result<Frame> {
    if text.len() > HEADER_SIZE {
        return Err(NetcacheError::Protocol(format!(
            "{} bytes do not fit in a {}-byte frame",
            text.len(),
            HEADER_SIZE
        )));
    }
    let mut frame = [b' '; HEADER_SIZE];
    frame[..text.len()].copy_from_slice(text.as_bytes());
    Ok(frame)
}

/// Response header announcing `length` payload bytes, or [`NOT_FOUND`]
pub fn encode_header(length: i64) -> Frame {
    let text = format!("{},", length);
    let mut frame = [b' '; HEADER_SIZE];
    frame[..text.len()].copy_from_slice(text.as_bytes());
    frame
}

/// Read one request frame.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly between
/// frames. A connection closing part way through a frame is an error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut frame = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = reader.read(&mut frame[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(NetcacheError::Protocol(format!(
                "connection closed after {} of {} frame bytes",
                filled, HEADER_SIZE
            )));
        }
        filled += n;
    }
    Ok(Some(frame))
}

pub async fn write_header<W>(writer: &mut W, length: i64) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&encode_header(length)).await?;
    Ok(())
}

/// Write a header followed by an in-memory payload
pub async fn write_payload<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_header(writer, payload.len() as i64).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Parse the length out of a response header
pub fn parse_header(frame: &[u8]) -> Result<i64> {
    let text = std::str::from_utf8(frame)
        .map_err(|_| NetcacheError::Protocol("header is not ASCII".to_string()))?;
    let length = text.trim_matches(is_padding).split(',').next().unwrap_or("");
    length
        .parse::<i64>()
        .map_err(|_| NetcacheError::Protocol(format!("invalid header length {:?}", length)))
}
