//! Upstream connection establishment: plain TCP, or a tunnel negotiated
//! with an HTTP CONNECT proxy that is handed the logical host name so it
//! can do its own resolution.

use std::io;
use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

// A CONNECT response header line longer than this is nonsense.
const MAX_HEADER_LINE: usize = 8192;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("connect to {addr} failed: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("connect to {addr} timed out")]
    ConnectTimeout { addr: String },
    #[error("CONNECT handshake with {addr} failed: {source}")]
    Handshake { addr: String, source: io::Error },
    #[error("CONNECT handshake with {addr} timed out")]
    HandshakeTimeout { addr: String },
    #[error("upstream {addr} refused CONNECT: {status_line:?}")]
    Refused { addr: String, status_line: String },
}

/// Open a TCP connection to `host:port`, resolving the host if needed.
pub async fn dial_direct(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, DialError> {
    let addr = format!("{host}:{port}");
    let stream = timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| DialError::ConnectTimeout { addr: addr.clone() })?
        .map_err(|source| DialError::Connect { addr, source })?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Establish a tunnel to `target_host:target_port` through an HTTP CONNECT
/// proxy. The target is advertised by name, never by original IP, and the
/// client address travels along in `X-Forwarded-For` / `Forwarded`. The
/// returned stream is positioned exactly past the proxy's response headers.
pub async fn dial_via_proxy(
    proxy_host: &str,
    proxy_port: u16,
    target_host: &str,
    target_port: u16,
    client_ip: IpAddr,
    io_timeout: Duration,
) -> Result<TcpStream, DialError> {
    let mut stream = dial_direct(proxy_host, proxy_port, io_timeout).await?;
    let proxy_addr = format!("{proxy_host}:{proxy_port}");

    match timeout(
        io_timeout,
        connect_handshake(&mut stream, &proxy_addr, target_host, target_port, client_ip),
    )
    .await
    {
        Ok(Ok(())) => Ok(stream),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(DialError::HandshakeTimeout { addr: proxy_addr }),
    }
}

async fn connect_handshake(
    stream: &mut TcpStream,
    proxy_addr: &str,
    target_host: &str,
    target_port: u16,
    client_ip: IpAddr,
) -> Result<(), DialError> {
    let io_err = |source| DialError::Handshake {
        addr: proxy_addr.to_string(),
        source,
    };

    let request = format!(
        "CONNECT {target_host}:{target_port} HTTP/1.1\r\n\
         Host: {target_host}:{target_port}\r\n\
         X-Forwarded-For: {client_ip}\r\n\
         Forwarded: for={client_ip}\r\n\
         \r\n"
    );
    stream.write_all(request.as_bytes()).await.map_err(io_err)?;

    let status_line = read_header_line(stream).await.map_err(io_err)?;
    if !status_line.starts_with("HTTP/1.1 200") {
        return Err(DialError::Refused {
            addr: proxy_addr.to_string(),
            status_line: status_line.trim_end().to_string(),
        });
    }

    // Drain the remaining response headers. The tunnel payload begins right
    // after the blank line, so the read must stop exactly there.
    loop {
        let line = read_header_line(stream).await.map_err(io_err)?;
        if line == "\r\n" || line.is_empty() {
            break;
        }
    }
    Ok(())
}

/// Read one header line including its terminating `\n`, one byte at a time.
/// Unbuffered on purpose: read-ahead here would swallow tunnel bytes.
async fn read_header_line(stream: &mut TcpStream) -> io::Result<String> {
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    loop {
        if stream.read(&mut byte).await? == 0 {
            break;
        }
        line.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
        if line.len() >= MAX_HEADER_LINE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "response header line too long",
            ));
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}
