use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::time::timeout;

use crate::settings::Settings;

/// Parse failures the listener branches on: `Malformed` earns a 400 response,
/// the rest close the connection without a reply because the client may not be
/// waiting for one yet.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("timed out {0}")]
    Timeout(String),
    #[error("request read failed: {0}")]
    Io(String),
}

/// Header collection with lowercase keys and last-write-wins on duplicates.
#[derive(Debug, Default)]
pub struct RequestHeaders {
    entries: Vec<(String, String)>,
}

impl RequestHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim().to_string();
        if let Some(entry) = self.entries.iter_mut().find(|(key, _)| *key == name) {
            entry.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
pub struct InboundRequest {
    pub method: String,
    pub target: String,
    pub headers: RequestHeaders,
    pub body: Vec<u8>,
}

impl InboundRequest {
    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }
}

/// Reads one request head (and body, for non-CONNECT methods) off the client
/// stream. `Ok(None)` means the client went away before sending anything
/// worth answering.
pub async fn read_request<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    settings: &Settings,
) -> Result<Option<InboundRequest>, RequestError>
where
    S: AsyncRead + Unpin,
{
    let read_timeout = settings.client_timeout();
    let max_line = settings.max_header_size;

    let Some(request_line) = read_line(reader, read_timeout, max_line, peer).await? else {
        return Ok(None);
    };
    if request_line.is_empty() {
        return Ok(None);
    }

    let tokens: Vec<&str> = request_line.split_whitespace().collect();
    if tokens.len() < 3 {
        return Err(RequestError::Malformed(format!(
            "request line '{request_line}' has {} tokens",
            tokens.len()
        )));
    }
    let method = tokens[0].to_ascii_uppercase();
    let target = tokens[1].to_string();

    let mut headers = RequestHeaders::new();
    loop {
        let Some(line) = read_line(reader, read_timeout, max_line, peer).await? else {
            break;
        };
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name, value);
        }
    }

    let mut body = Vec::new();
    if method != "CONNECT" {
        if let Some(value) = headers.get("content-length") {
            let length: usize = value.parse().map_err(|_| {
                RequestError::Malformed(format!("invalid content-length '{value}'"))
            })?;
            if length > settings.max_body_size {
                return Err(RequestError::Malformed(format!(
                    "request body of {length} bytes exceeds limit of {} bytes",
                    settings.max_body_size
                )));
            }
            if length > 0 {
                body = read_body(reader, length, read_timeout, peer).await?;
            }
        }
    }

    Ok(Some(InboundRequest {
        method,
        target,
        headers,
        body,
    }))
}

/// Reads one CRLF-terminated line, applying the read timeout to every fill of
/// the underlying buffer. `Ok(None)` is a clean EOF before any bytes arrived.
async fn read_line<S>(
    reader: &mut BufReader<S>,
    read_timeout: Duration,
    max_len: usize,
    peer: SocketAddr,
) -> Result<Option<String>, RequestError>
where
    S: AsyncRead + Unpin,
{
    let mut collected = Vec::new();
    loop {
        let available = match timeout(read_timeout, reader.fill_buf()).await {
            Ok(Ok(buf)) => buf,
            Ok(Err(err)) => return Err(RequestError::Io(err.to_string())),
            Err(_) => return Err(RequestError::Timeout(format!("reading from {peer}"))),
        };

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(None);
            }
            return Err(RequestError::Io(format!(
                "connection closed mid-line by {peer}"
            )));
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if collected.len() + consume > max_len {
            return Err(RequestError::Malformed(format!(
                "line from {peer} exceeds configured limit of {max_len} bytes"
            )));
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let mut line = String::from_utf8(collected)
        .map_err(|_| RequestError::Malformed(format!("line from {peer} contained invalid bytes")))?;
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

async fn read_body<S>(
    reader: &mut BufReader<S>,
    length: usize,
    read_timeout: Duration,
    peer: SocketAddr,
) -> Result<Vec<u8>, RequestError>
where
    S: AsyncRead + Unpin,
{
    let mut body = vec![0u8; length];
    match timeout(read_timeout, reader.read_exact(&mut body)).await {
        Ok(Ok(_)) => Ok(body),
        Ok(Err(err)) => Err(RequestError::Io(format!(
            "reading {length}-byte body from {peer}: {err}"
        ))),
        Err(_) => Err(RequestError::Timeout(format!(
            "reading {length}-byte body from {peer}"
        ))),
    }
}
