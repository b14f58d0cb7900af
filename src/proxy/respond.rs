use std::time::Duration;

use http::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Writes a minimal HTTP/1.1 error response and flushes it. The message
/// appears both in the status line and as the plain-text body. Write failures
/// are swallowed: the client may already be gone, and we are closing the
/// connection either way.
pub async fn send_error<W>(
    writer: &mut W,
    status: StatusCode,
    message: &str,
    write_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    let response = build_error_response(status, message);
    let _ = timeout(write_timeout, async {
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await
    })
    .await;
}

fn build_error_response(status: StatusCode, message: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status.as_u16(),
        message,
        message.len(),
        message
    )
}
