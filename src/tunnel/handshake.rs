use std::io;

use http::{StatusCode, Version};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use super::Authority;

/// Host header value sent with every CONNECT.
///
/// The proxy this tool targets expects the loopback literal here regardless
/// of the tunnel target, so it must not be derived from the target.
pub const CONNECT_HOST_HEADER: &str = "127.0.0.1";

/// Upper bound for the whole response head, status line included.
const MAX_HEAD_BYTES: usize = 16 * 1024;

#[derive(Error, Debug)]
pub(super) enum HeadError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("unexpected EOF")]
    Eof,

    #[error("response head exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("malformed HTTP status line {0:?}")]
    StatusLine(String),

    #[error("malformed HTTP header line {0:?}")]
    HeaderLine(String),

    #[error("response head is not valid UTF-8")]
    Encoding,
}

/// The CONNECT request, byte for byte.
pub fn connect_request(target: &Authority) -> String {
    format!("CONNECT {target} HTTP/1.1\r\nHost: {CONNECT_HOST_HEADER}\r\n\r\n")
}

pub(super) async fn write_connect<S>(stream: &mut S, target: &Authority) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(connect_request(target).as_bytes()).await?;
    stream.flush().await
}

/// Status line and headers the proxy sent back for the CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    pub version: Version,
    pub status: StatusCode,
    /// Everything after the version on the status line, e.g. `502 Bad Gateway`.
    pub status_text: String,
    pub headers: Vec<(String, String)>,
}

impl ProxyResponse {
    pub fn is_success(&self) -> bool {
        self.status == StatusCode::OK
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn from_status_line(line: &str) -> Result<Self, HeadError> {
        let malformed = || HeadError::StatusLine(line.to_string());

        let (version, rest) = line.split_once(' ').ok_or_else(malformed)?;
        let version = match version {
            "HTTP/1.1" => Version::HTTP_11,
            "HTTP/1.0" => Version::HTTP_10,
            _ => return Err(malformed()),
        };

        let status_text = rest.trim_start_matches(' ').trim_end().to_string();
        let code = status_text
            .split(' ')
            .next()
            .filter(|code| code.len() == 3)
            .ok_or_else(malformed)?;
        let status = StatusCode::from_bytes(code.as_bytes()).map_err(|_| malformed())?;

        Ok(Self {
            version,
            status,
            status_text,
            headers: Vec::new(),
        })
    }
}

/// Read one response head, leaving anything after the blank line in `reader`.
pub(super) async fn read_response<S>(reader: &mut BufReader<S>) -> Result<ProxyResponse, HeadError>
where
    S: AsyncRead + Unpin,
{
    let mut budget = MAX_HEAD_BYTES;

    let status_line = read_line(reader, &mut budget).await?.ok_or(HeadError::Eof)?;
    let mut response = ProxyResponse::from_status_line(&status_line)?;

    loop {
        let line = read_line(reader, &mut budget).await?.ok_or(HeadError::Eof)?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .filter(|(name, _)| !name.is_empty() && !name.contains(char::is_whitespace))
            .ok_or_else(|| HeadError::HeaderLine(line.clone()))?;
        response
            .headers
            .push((name.to_string(), value.trim().to_string()));
    }

    Ok(response)
}

/// Read a single line without its terminator, consuming exactly through `\n`.
///
/// Returns `None` on a clean EOF before any byte of the line.
async fn read_line<S>(reader: &mut BufReader<S>, budget: &mut usize) -> Result<Option<String>, HeadError>
where
    S: AsyncRead + Unpin,
{
    let mut collected = Vec::new();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if collected.is_empty() {
                return Ok(None);
            }
            return Err(HeadError::Eof);
        }

        let newline = available.iter().position(|byte| *byte == b'\n');
        let consume = newline.map(|idx| idx + 1).unwrap_or(available.len());
        if consume > *budget {
            return Err(HeadError::TooLarge {
                limit: MAX_HEAD_BYTES,
            });
        }
        *budget -= consume;

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline.is_some() {
            break;
        }
    }

    collected.pop();
    if collected.last() == Some(&b'\r') {
        collected.pop();
    }
    String::from_utf8(collected)
        .map(Some)
        .map_err(|_| HeadError::Encoding)
}
