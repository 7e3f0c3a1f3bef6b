//! Application-layer handshake.
//!
//! One HTTP/1.0-shaped request/response exchanged over the freshly
//! established TLS stream, before framed mode begins:
//!
//! ```text
//! POST / HTTP/1.0
//! Content-Type: application/json
//! Content-Length: <N>
//!
//! {"time":"<RFC3339>","version":"0.1.0"}
//! ```
//!
//! The server answers `HTTP/1.0 200 OK` with a JSON [`ClientSettings`] body
//! carrying the tunnel address it allocated. Afterwards the buffered reader
//! must be empty; leftover bytes mean the peer started framed mode early and
//! the session is torn down.

use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Largest accepted handshake body.
const MAX_BODY: usize = 8192;

/// First packet from the client after connecting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub time: String,
    pub version: String,
}

impl ClientInfo {
    pub fn now() -> Self {
        Self {
            time: timestamp(),
            version: crate::VERSION.to_string(),
        }
    }
}

/// Server reply: the settings the client needs to bring its tunnel up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    pub time: String,
    pub version: String,
    pub ip: String,
}

/// Current time as an RFC3339 string, the format both ends exchange.
pub fn timestamp() -> String {
    humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
}

/// Server half: read the request line, MIME headers, and JSON body.
pub async fn read_client_info<R>(rdr: &mut R) -> Result<ClientInfo>
where
    R: AsyncBufRead + Unpin,
{
    let (request, headers) = read_head(rdr).await?;
    if !request.starts_with("POST") {
        return Err(Error::BadHandshake(format!(
            "unexpected request line: {request:?}"
        )));
    }

    let body = read_body(rdr, &headers).await?;
    serde_json::from_slice(&body)
        .map_err(|e| Error::BadHandshake(format!("client info decode: {e}")))
}

/// Server half: write the `200 OK` response with the settings body.
pub async fn write_settings<W>(wr: &mut W, settings: &ClientSettings) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(settings)
        .map_err(|e| Error::BadHandshake(format!("settings encode: {e}")))?;

    let head = format!(
        "HTTP/1.0 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    wr.write_all(head.as_bytes()).await?;
    wr.write_all(&body).await?;
    wr.flush().await?;
    Ok(())
}

/// Client half: write the request with the info body.
pub async fn write_client_info<W>(wr: &mut W, info: &ClientInfo) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(info)
        .map_err(|e| Error::BadHandshake(format!("client info encode: {e}")))?;

    let head = format!(
        "POST / HTTP/1.0\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    wr.write_all(head.as_bytes()).await?;
    wr.write_all(&body).await?;
    wr.flush().await?;
    Ok(())
}

/// Client half: read the response status, headers, and JSON settings body.
pub async fn read_settings<R>(rdr: &mut R) -> Result<ClientSettings>
where
    R: AsyncBufRead + Unpin,
{
    let (status, headers) = read_head(rdr).await?;
    if !status.starts_with("HTTP/1.0 200") {
        return Err(Error::BadHandshake(format!("server refused: {status:?}")));
    }

    let body = read_body(rdr, &headers).await?;
    serde_json::from_slice(&body)
        .map_err(|e| Error::BadHandshake(format!("settings decode: {e}")))
}

/// Read the start line and MIME headers up to the blank line.
///
/// Header names are lowercased; bare `\n` line endings are accepted alongside
/// `\r\n` since early peers sent them.
async fn read_head<R>(rdr: &mut R) -> Result<(String, HashMap<String, String>)>
where
    R: AsyncBufRead + Unpin,
{
    let start = read_line(rdr).await?;

    let mut headers = HashMap::new();
    loop {
        let line = read_line(rdr).await?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::BadHandshake(format!("malformed header: {line:?}")))?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    Ok((start, headers))
}

async fn read_line<R>(rdr: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = rdr.read_line(&mut line).await?;
    if n == 0 {
        return Err(Error::BadHandshake("unexpected end of stream".into()));
    }
    Ok(line.trim_end().to_string())
}

async fn read_body<R>(rdr: &mut R, headers: &HashMap<String, String>) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let len: usize = headers
        .get("content-length")
        .ok_or_else(|| Error::BadHandshake("missing content-length".into()))?
        .parse()
        .map_err(|_| Error::BadHandshake("unparseable content-length".into()))?;

    if len == 0 || len > MAX_BODY {
        return Err(Error::BadHandshake(format!(
            "content-length {len} out of range"
        )));
    }

    let mut body = vec![0u8; len];
    rdr.read_exact(&mut body)
        .await
        .map_err(|_| Error::BadHandshake("truncated body".into()))?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn info_and_settings_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_rd, mut client_wr) = tokio::io::split(client);
        let (server_rd, mut server_wr) = tokio::io::split(server);
        let mut client_rd = BufReader::new(client_rd);
        let mut server_rd = BufReader::new(server_rd);

        write_client_info(&mut client_wr, &ClientInfo::now())
            .await
            .unwrap();

        let info = read_client_info(&mut server_rd).await.unwrap();
        assert_eq!(info.version, crate::VERSION);

        let sent = ClientSettings {
            time: timestamp(),
            version: crate::VERSION.to_string(),
            ip: "192.168.0.2".into(),
        };
        write_settings(&mut server_wr, &sent).await.unwrap();

        let settings = read_settings(&mut client_rd).await.unwrap();
        assert_eq!(settings.ip, "192.168.0.2");
        // Framed mode has not started; nothing may be buffered.
        assert!(client_rd.buffer().is_empty());
    }

    #[tokio::test]
    async fn rejects_wrong_request_line() {
        let (mut a, b) = tokio::io::duplex(1024);
        a.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();

        let mut rdr = BufReader::new(b);
        let err = read_client_info(&mut rdr).await.unwrap_err();
        assert!(matches!(err, Error::BadHandshake(_)));
    }

    #[tokio::test]
    async fn rejects_oversize_body() {
        let (mut a, b) = tokio::io::duplex(1024);
        a.write_all(b"POST / HTTP/1.0\r\nContent-Length: 999999\r\n\r\n")
            .await
            .unwrap();

        let mut rdr = BufReader::new(b);
        let err = read_client_info(&mut rdr).await.unwrap_err();
        assert!(matches!(err, Error::BadHandshake(_)));
    }

    #[tokio::test]
    async fn accepts_bare_newlines() {
        let (mut a, b) = tokio::io::duplex(1024);
        let body = br#"{"time":"2020-01-01T00:00:00Z","version":"0.1.0"}"#;
        let head = format!("POST / HTTP/1.0\nContent-Length: {}\n\n", body.len());
        a.write_all(head.as_bytes()).await.unwrap();
        a.write_all(body).await.unwrap();

        let mut rdr = BufReader::new(b);
        let info = read_client_info(&mut rdr).await.unwrap();
        assert_eq!(info.version, "0.1.0");
    }
}
