use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::settings::{ProxyEndpoint, Settings};

/// A negotiated tunnel. The buffered reader stays attached so bytes the
/// upstream sends right behind its 200 response are not lost.
pub type TunnelStream = BufReader<TcpStream>;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to connect to {proxy}: {source}")]
    Connect {
        proxy: String,
        source: std::io::Error,
    },
    #[error("timed out {0}")]
    Timeout(String),
    #[error("proxy {proxy} returned unusable response: {detail}")]
    Protocol { proxy: String, detail: String },
    #[error("proxy {proxy} refused tunnel to {target}: {status} {message}")]
    Rejected {
        proxy: String,
        target: String,
        status: u16,
        message: String,
    },
}

impl TunnelError {
    /// Status code to relay to the client. Upstream rejections pass through
    /// verbatim when the code is valid; everything else is a 502.
    pub fn status_code(&self) -> http::StatusCode {
        match self {
            TunnelError::Rejected { status, .. } => http::StatusCode::from_u16(*status)
                .unwrap_or(http::StatusCode::BAD_GATEWAY),
            _ => http::StatusCode::BAD_GATEWAY,
        }
    }

    /// Body and status-line text for the client-facing error response.
    pub fn client_message(&self) -> String {
        match self {
            TunnelError::Rejected { status, message, .. } => {
                if message.is_empty() {
                    http::StatusCode::from_u16(*status)
                        .ok()
                        .and_then(|s| s.canonical_reason())
                        .unwrap_or("Bad Gateway")
                        .to_string()
                } else {
                    message.clone()
                }
            }
            TunnelError::Connect { .. } | TunnelError::Timeout(_) => {
                "Failed to connect to upstream proxy".to_string()
            }
            TunnelError::Protocol { .. } => "Invalid response from upstream proxy".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TunnelTimeouts {
    pub connect: Duration,
    pub read: Duration,
}

impl TunnelTimeouts {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            connect: settings.connect_timeout(),
            read: settings.client_timeout(),
        }
    }
}

/// Opens a TCP connection to a proxy, without negotiating anything yet. Used
/// both as the first leg of a tunnel and for plain-HTTP forwarding.
pub async fn open_proxy_stream(
    proxy: &ProxyEndpoint,
    timeouts: TunnelTimeouts,
) -> Result<TunnelStream, TunnelError> {
    let address = proxy.address();
    let stream = match timeout(timeouts.connect, TcpStream::connect(&address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(TunnelError::Connect {
                proxy: address,
                source,
            });
        }
        Err(_) => {
            return Err(TunnelError::Timeout(format!("connecting to {address}")));
        }
    };
    let _ = stream.set_nodelay(true);
    Ok(BufReader::new(stream))
}

/// Issues one CONNECT over `existing` if given, otherwise over a fresh
/// connection to `proxy`. On rejection a freshly opened socket is dropped;
/// callers chaining over an existing socket lose it either way, which is the
/// point: a half-negotiated chain is not reusable.
pub async fn establish_tunnel(
    host: &str,
    port: u16,
    proxy: &ProxyEndpoint,
    existing: Option<TunnelStream>,
    timeouts: TunnelTimeouts,
) -> Result<TunnelStream, TunnelError> {
    let mut stream = match existing {
        Some(stream) => stream,
        None => open_proxy_stream(proxy, timeouts).await?,
    };

    let request = build_connect_request(host, port, proxy.basic_auth_value().as_deref());
    send_connect_request(&mut stream, &request, &proxy.address(), timeouts.read).await?;
    read_connect_response(&mut stream, &proxy.address(), host, port, timeouts.read).await?;
    Ok(stream)
}

/// Two sequential CONNECTs over one socket: corporate opens a tunnel to the
/// rotating proxy, then the rotating proxy (spoken to through that tunnel)
/// opens the tunnel to the real target.
pub async fn establish_chained_tunnel(
    host: &str,
    port: u16,
    corporate: &ProxyEndpoint,
    rotating: &ProxyEndpoint,
    timeouts: TunnelTimeouts,
) -> Result<TunnelStream, TunnelError> {
    let stream =
        establish_tunnel(&rotating.host, rotating.port, corporate, None, timeouts).await?;
    establish_tunnel(host, port, rotating, Some(stream), timeouts).await
}

pub fn build_connect_request(host: &str, port: u16, auth: Option<&str>) -> String {
    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some(auth) = auth {
        request.push_str("Proxy-Authorization: ");
        request.push_str(auth);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    request
}

async fn send_connect_request<S>(
    stream: &mut S,
    request: &str,
    proxy: &str,
    write_timeout: Duration,
) -> Result<(), TunnelError>
where
    S: AsyncWrite + Unpin,
{
    match timeout(write_timeout, async {
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(TunnelError::Protocol {
            proxy: proxy.to_string(),
            detail: format!("write failed: {err}"),
        }),
        Err(_) => Err(TunnelError::Timeout(format!(
            "sending CONNECT to {proxy}"
        ))),
    }
}

/// Reads the CONNECT response status line and discards headers up to the
/// blank line. Anything other than a 2xx becomes `Rejected` carrying the
/// proxy's own status and message.
pub async fn read_connect_response<S>(
    stream: &mut BufReader<S>,
    proxy: &str,
    host: &str,
    port: u16,
    read_timeout: Duration,
) -> Result<(), TunnelError>
where
    S: AsyncRead + Unpin,
{
    let status_line = read_response_line(stream, proxy, read_timeout).await?;
    if status_line.is_empty() {
        return Err(TunnelError::Protocol {
            proxy: proxy.to_string(),
            detail: "connection closed before CONNECT response".to_string(),
        });
    }

    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next();
    let status: u16 = parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| TunnelError::Protocol {
            proxy: proxy.to_string(),
            detail: format!("unparseable status line '{status_line}'"),
        })?;
    let message = parts.next().unwrap_or("").trim().to_string();

    // Drain response headers so the stream is positioned at tunnel payload.
    loop {
        let line = read_response_line(stream, proxy, read_timeout).await?;
        if line.is_empty() {
            break;
        }
    }

    if (200..300).contains(&status) {
        return Ok(());
    }
    Err(TunnelError::Rejected {
        proxy: proxy.to_string(),
        target: format!("{host}:{port}"),
        status,
        message,
    })
}

async fn read_response_line<S>(
    stream: &mut BufReader<S>,
    proxy: &str,
    read_timeout: Duration,
) -> Result<String, TunnelError>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    match timeout(read_timeout, stream.read_line(&mut line)).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => {
            return Err(TunnelError::Protocol {
                proxy: proxy.to_string(),
                detail: format!("read failed: {err}"),
            });
        }
        Err(_) => {
            return Err(TunnelError::Timeout(format!(
                "waiting for CONNECT response from {proxy}"
            )));
        }
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}
