use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod context;
mod dial;
mod original_dst;
mod relay;
mod sniff;

use crate::config::{Settings, TimeoutPolicy, BUFFER_SIZE};
use crate::rules::{Action, RuleSet};
use context::{ConnectionContext, ListenerClass};
use relay::Deadline;

#[derive(Debug, Error)]
enum ConnectionError {
    #[error("reading initial bytes from client failed: {0}")]
    Peek(io::Error),
    #[error("timed out waiting for initial bytes from client")]
    PeekTimeout,
    #[error(transparent)]
    Dial(#[from] dial::DialError),
    #[error("replaying initial bytes to upstream failed: {0}")]
    Replay(io::Error),
}

/// Bind both listeners and serve until the process exits. A bind failure is
/// fatal; everything after that is per-connection and logged.
pub async fn start(settings: Arc<Settings>, rules: Arc<RuleSet>) -> anyhow::Result<()> {
    let listen = &settings.listen;
    let sni_listener = TcpListener::bind((listen.host.as_str(), listen.https_port))
        .await
        .with_context(|| format!("binding SNI listener to {}:{}", listen.host, listen.https_port))?;
    let host_listener = TcpListener::bind((listen.host.as_str(), listen.http_port))
        .await
        .with_context(|| format!("binding Host listener to {}:{}", listen.host, listen.http_port))?;

    info!("SNI proxy (HTTPS) listening on {}:{}", listen.host, listen.https_port);
    info!("Host proxy (HTTP) listening on {}:{}", listen.host, listen.http_port);
    info!("routing rules:");
    for (i, rule) in settings.rules.iter().enumerate() {
        info!("  {}. {} -> {}", i + 1, rule.pattern, rule.proxy);
    }

    tokio::try_join!(
        accept_loop(sni_listener, ListenerClass::Tls, settings.clone(), rules.clone()),
        accept_loop(host_listener, ListenerClass::Http, settings.clone(), rules),
    )?;
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    class: ListenerClass,
    settings: Arc<Settings>,
    rules: Arc<RuleSet>,
) -> anyhow::Result<()> {
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!("{} listener accept error: {err}", class.label());
                continue;
            }
        };
        let settings = settings.clone();
        let rules = rules.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(socket, addr, class, settings, rules).await {
                warn!("connection from {addr} failed: {err}");
            }
        });
    }
}

/// Drive one accepted flow: recover the original destination, peek the
/// first bytes, extract the host name, resolve a rule, dial, replay the
/// peeked bytes, then relay both directions until either side is done.
async fn handle_connection(
    mut client: TcpStream,
    client_addr: SocketAddr,
    class: ListenerClass,
    settings: Arc<Settings>,
    rules: Arc<RuleSet>,
) -> Result<(), ConnectionError> {
    let _ = client.set_nodelay(true);

    let listen = &settings.listen;
    let deadline = match listen.timeout_policy {
        TimeoutPolicy::Fixed => Deadline::Fixed(Instant::now() + listen.timeout),
        TimeoutPolicy::Idle => Deadline::Idle(listen.timeout),
    };
    let resolved = original_dst::original_dst(&client);
    let mut ctx = ConnectionContext::new(client_addr, class, resolved, deadline);

    let mut buf = vec![0u8; BUFFER_SIZE];
    let n = match ctx.deadline.bound(client.read(&mut buf)).await {
        Ok(Ok(0)) => return Ok(()), // client went away without a word
        Ok(Ok(n)) => n,
        Ok(Err(err)) => return Err(ConnectionError::Peek(err)),
        Err(_) => return Err(ConnectionError::PeekTimeout),
    };
    buf.truncate(n);
    ctx.peek_buf = buf;

    match ctx.class {
        ListenerClass::Tls => {
            ctx.target_port = ctx.original_dst.port();
            match sniff::parse_sni(&ctx.peek_buf) {
                Some(host) => ctx.host_name = host,
                None => {
                    // an IP is still matchable against the rule list
                    info!(
                        "no SNI from {}, matching original destination {}",
                        ctx.client_addr,
                        ctx.original_dst.ip()
                    );
                    ctx.host_name = ctx.original_dst.ip().to_string();
                }
            }
        }
        ListenerClass::Http => {
            let (host, port) = sniff::parse_http_host(&ctx.peek_buf);
            if host.is_empty() {
                info!("no Host header from {}, closing", ctx.client_addr);
                return Ok(());
            }
            ctx.host_name = host;
            ctx.target_port = port;
        }
    }

    let mut upstream = match rules.resolve(&ctx.host_name) {
        Action::Drop => {
            info!(
                "{} => {}: Drop for {}:{}",
                ctx.client_addr, ctx.original_dst, ctx.host_name, ctx.target_port
            );
            return Ok(());
        }
        Action::Direct => {
            info!(
                "{} => {}: Direct connection for {}:{}",
                ctx.client_addr, ctx.original_dst, ctx.host_name, ctx.target_port
            );
            dial::dial_direct(&ctx.host_name, ctx.target_port, listen.timeout).await?
        }
        Action::Proxy { host, port } => {
            info!(
                "{} => {}: Proxying connection for {}:{} via {host}:{port}",
                ctx.client_addr, ctx.original_dst, ctx.host_name, ctx.target_port
            );
            dial::dial_via_proxy(
                &host,
                port,
                &ctx.host_name,
                ctx.target_port,
                ctx.client_addr.ip(),
                listen.timeout,
            )
            .await?
        }
    };

    // nothing peeked is lost: the upstream sees the stream from byte zero
    upstream
        .write_all(&ctx.peek_buf)
        .await
        .map_err(ConnectionError::Replay)?;

    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();
    let cancel = CancellationToken::new();
    let (sent, received) = tokio::join!(
        relay::relay(client_read, upstream_write, cancel.clone(), ctx.deadline),
        relay::relay(upstream_read, client_write, cancel, ctx.deadline),
    );

    match (sent, received) {
        (Ok(sent), Ok(received)) => debug!(
            "{}: finished, {sent} bytes out, {received} bytes in",
            ctx.client_addr
        ),
        (sent, received) => {
            if let Err(err) = sent {
                debug!("{}: client->upstream relay ended: {err}", ctx.client_addr);
            }
            if let Err(err) = received {
                debug!("{}: upstream->client relay ended: {err}", ctx.client_addr);
            }
        }
    }
    Ok(())
}
