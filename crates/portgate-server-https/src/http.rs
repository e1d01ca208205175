//! Minimal HTTP/1.1 plumbing for non-proxied connections
//!
//! Connections that cannot be spliced (unknown SNI, failed channel open,
//! bare base-domain requests) still deserve a well-formed HTTP answer. The
//! request head is consumed first so the client is not answered mid-send.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum number of headers to parse
const MAX_HEADERS: usize = 100;

/// Upper bound on a request head before the connection is abandoned.
const MAX_REQUEST_HEAD: usize = 16 * 1024;

/// Read and discard exactly one request line + headers. Fails if the peer
/// closes early, sends garbage, or never finishes the head.
async fn consume_request_head<S>(stream: &mut S) -> io::Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buf) {
            Ok(httparse::Status::Complete(_)) => return Ok(()),
            Ok(httparse::Status::Partial) if buf.len() > MAX_REQUEST_HEAD => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "request head too large",
                ));
            }
            Ok(httparse::Status::Partial) => continue,
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }
}

/// Consume one request and answer it with `status` and a short body.
pub(crate) async fn error_out<S>(stream: &mut S, status: &str, body: &str) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    consume_request_head(stream).await?;
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await
}

/// Consume one request and answer it with a temporary redirect.
pub(crate) async fn redirect<S>(stream: &mut S, location: &str) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    consume_request_head(stream).await?;
    let response = format!("HTTP/1.1 307 Temporary Redirect\r\nLocation: {location}\r\n\r\n");
    stream.write_all(response.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: x.example.test\r\n\r\n";

    #[tokio::test]
    async fn error_out_answers_after_the_request() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(REQUEST).await.unwrap();

        error_out(&mut server, "503 Service Unavailable", "No tunnel available.")
            .await
            .unwrap();
        drop(server);

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(response.contains("Content-Length: 20\r\n"));
        assert!(response.ends_with("No tunnel available."));
    }

    #[tokio::test]
    async fn redirect_carries_location_header() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(REQUEST).await.unwrap();

        redirect(&mut server, "https://docs.example.test").await.unwrap();
        drop(server);

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 307 Temporary Redirect\r\n"));
        assert!(response.contains("Location: https://docs.example.test\r\n"));
    }

    #[tokio::test]
    async fn early_close_yields_no_response() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        drop(client);

        let result = error_out(&mut server, "503 Service Unavailable", "nope").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn request_split_across_reads_is_assembled() {
        let (mut client, mut server) = tokio::io::duplex(16);
        let write = async {
            client.write_all(REQUEST).await.unwrap();
            let mut response = Vec::new();
            client.read_to_end(&mut response).await.unwrap();
            response
        };
        let respond = async {
            error_out(&mut server, "502 Bad Gateway", "boom").await.unwrap();
            drop(server);
        };
        let (response, ()) = tokio::join!(write, respond);
        assert!(String::from_utf8(response).unwrap().starts_with("HTTP/1.1 502"));
    }
}
