//! The control TCP port (C9, ambient).
//!
//! Answers a one-shot `health <token>` request with `health:<token>\n`, mirroring
//! `sr-control-server.c`'s accept/read/write/close cycle. Exists so an external supervisor can
//! confirm this process (not a downstream) is alive without going through the data plane.

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const CONTROL_REQUEST_BUF_SIZE: usize = 32;
const HEALTH_CHECK_REQUEST: &str = "health";

/// Accepts connections on `listener` forever, handling each on its own task.
pub async fn serve(listener: TcpListener) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("control accept failed")?;
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream).await {
                tracing::debug!(%peer, error = %e, "control connection closed with error");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream) -> Result<()> {
    let mut buf = [0u8; CONTROL_REQUEST_BUF_SIZE];
    let n = stream.read(&mut buf).await.context("control read failed")?;
    if n == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buf[..n]);
    let request = request.trim_end_matches(['\n', ' ']);

    if let Some(response) = build_response(request) {
        stream
            .write_all(response.as_bytes())
            .await
            .context("control write failed")?;
    }

    Ok(())
}

/// `"health abc123"` -> `Some("health:abc123\n")`; anything else -> `None` (connection is
/// closed without a reply, matching the original's silent drop of unrecognized commands).
fn build_response(request: &str) -> Option<String> {
    let mut parts = request.splitn(2, ' ');
    let command = parts.next()?;
    let token = parts.next()?;

    if command != HEALTH_CHECK_REQUEST || token.is_empty() {
        return None;
    }

    Some(format!("{HEALTH_CHECK_REQUEST}:{token}\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_request_echoes_token() {
        assert_eq!(
            build_response("health abc123"),
            Some("health:abc123\n".to_string())
        );
    }

    #[test]
    fn unknown_command_is_ignored() {
        assert_eq!(build_response("ping abc123"), None);
    }

    #[test]
    fn missing_token_is_ignored() {
        assert_eq!(build_response("health"), None);
    }

    #[tokio::test]
    async fn end_to_end_request_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"health mytoken\n").await.unwrap();

        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"health:mytoken\n");
    }
}
