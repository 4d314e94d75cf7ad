//! Network Collectors
//!
//! TCP and UDP listeners that turn syslog frames into stamped events on
//! the batcher channel. TCP frames are newline-delimited with a bounded
//! buffer and a one-second idle-read timeout that flushes any partial
//! frame; TLS is optional. UDP treats each datagram as one frame.
//!
//! Producers block on the bounded channel when the batcher is saturated,
//! which is the ingest backpressure mechanism.

use crate::event::Event;
use crate::observe::Stats;
use crate::syslog::{LineDelimiter, LogParser, ParseError};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use thiserror::Error;

/// Cap on a single TCP frame.
const MSG_BUF_SIZE: usize = 1024 * 1024;

/// How long a connection may sit idle before partial input is flushed.
const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest accepted UDP datagram.
const UDP_BUF_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum InputError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("tls: {0}")]
    Tls(String),
}

/// Build a TLS acceptor from PEM certificate and key files.
pub fn load_tls_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor, InputError> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(std::fs::File::open(cert)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(std::fs::File::open(
        key,
    )?))?
    .ok_or_else(|| InputError::Tls("no private key found".to_string()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| InputError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Bind a TCP collector and spawn its accept loop. Returns the bound
/// address.
pub async fn start_tcp(
    bind: &str,
    format: &str,
    tls: Option<TlsAcceptor>,
    tx: mpsc::Sender<Event>,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
) -> Result<SocketAddr, InputError> {
    let parser = Arc::new(LogParser::new(format)?);
    let listener = TcpListener::bind(bind).await?;
    let addr = listener.local_addr()?;
    tracing::info!("tcp collector listening on {}", addr);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!("tcp accept: {}", e);
                            continue;
                        }
                    };
                    let parser = Arc::clone(&parser);
                    let tx = tx.clone();
                    let stats = Arc::clone(&stats);
                    let shutdown = shutdown.clone();
                    match tls.clone() {
                        Some(acceptor) => {
                            tokio::spawn(async move {
                                match acceptor.accept(stream).await {
                                    Ok(tls_stream) => {
                                        handle_conn(tls_stream, peer, parser, tx, stats, shutdown)
                                            .await
                                    }
                                    Err(e) => tracing::warn!("tls handshake with {}: {}", peer, e),
                                }
                            });
                        }
                        None => {
                            tokio::spawn(handle_conn(stream, peer, parser, tx, stats, shutdown));
                        }
                    }
                }
            }
        }
        tracing::info!("tcp collector stopped");
    });

    Ok(addr)
}

async fn handle_conn<S: AsyncRead + Unpin>(
    mut stream: S,
    peer: SocketAddr,
    parser: Arc<LogParser>,
    tx: mpsc::Sender<Event>,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
) {
    let address = peer.to_string();
    let mut delimiter = LineDelimiter::new(MSG_BUF_SIZE);
    let mut chunk = [0u8; 4096];

    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            r = tokio::time::timeout(IDLE_READ_TIMEOUT, stream.read(&mut chunk)) => r,
        };
        match read {
            // Idle: flush whatever partial frame is buffered.
            Err(_) => {
                if let Some(line) = delimiter.vestige() {
                    if !emit(line, &address, &parser, &tx, &stats, true).await {
                        return;
                    }
                }
            }
            Ok(Ok(0)) => {
                if let Some(line) = delimiter.vestige() {
                    emit(line, &address, &parser, &tx, &stats, true).await;
                }
                break;
            }
            Ok(Ok(n)) => {
                for b in &chunk[..n] {
                    if let Some(line) = delimiter.push(*b) {
                        if !emit(line, &address, &parser, &tx, &stats, true).await {
                            return;
                        }
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::debug!("tcp read from {}: {}", address, e);
                if let Some(line) = delimiter.vestige() {
                    emit(line, &address, &parser, &tx, &stats, true).await;
                }
                break;
            }
        }
    }
}

/// Bind a UDP collector and spawn its receive loop. Returns the bound
/// address.
pub async fn start_udp(
    bind: &str,
    format: &str,
    tx: mpsc::Sender<Event>,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
) -> Result<SocketAddr, InputError> {
    let parser = Arc::new(LogParser::new(format)?);
    let socket = UdpSocket::bind(bind).await?;
    let addr = socket.local_addr()?;
    tracing::info!("udp collector listening on {}", addr);

    tokio::spawn(async move {
        let mut buf = [0u8; UDP_BUF_SIZE];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = socket.recv_from(&mut buf) => {
                    let (n, peer) = match received {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!("udp recv: {}", e);
                            continue;
                        }
                    };
                    let line = String::from_utf8_lossy(&buf[..n]).trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    let address = peer.ip().to_string();
                    if !emit(line, &address, &parser, &tx, &stats, false).await {
                        break;
                    }
                }
            }
        }
        tracing::info!("udp collector stopped");
    });

    Ok(addr)
}

/// Parse, stamp and forward one frame. Returns false when the channel
/// is gone and the caller should stop.
async fn emit(
    line: String,
    address: &str,
    parser: &LogParser,
    tx: &mpsc::Sender<Event>,
    stats: &Stats,
    tcp: bool,
) -> bool {
    let (fields, fallback) = parser.parse(&line);
    if fallback {
        Stats::incr(&stats.parse_failures);
    }
    Stats::incr(&stats.events_rx);
    if tcp {
        Stats::incr(&stats.tcp_events_rx);
    } else {
        Stats::incr(&stats.udp_events_rx);
    }

    let mut event = Event::new(line, fields);
    event.stamp(address);
    tx.send(event).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FieldValue;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_tcp_collector_frames_and_stamps() {
        let (tx, mut rx) = mpsc::channel(16);
        let stats = Arc::new(Stats::new());
        let shutdown = CancellationToken::new();
        let addr = start_tcp("127.0.0.1:0", "rfc5424", None, tx, Arc::clone(&stats), shutdown.clone())
            .await
            .unwrap();

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"<34>1 2023-01-02T03:04:05Z host app 42 ID1 - first\n")
            .await
            .unwrap();
        conn.write_all(b"<34>1 2023-01-02T03:04:06Z host app 42 ID2 - second\n")
            .await
            .unwrap();
        conn.shutdown().await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        shutdown.cancel();

        assert_eq!(
            first.fields.get("message"),
            Some(&FieldValue::Text("first".to_string()))
        );
        assert_eq!(
            second.fields.get("message"),
            Some(&FieldValue::Text("second".to_string()))
        );
        assert!(first.sequence > 0);
        assert!(first.fields.contains_key("address"));
        assert!(first.fields.contains_key("reception"));
        assert_eq!(stats.snapshot().tcp_events_rx, 2);
    }

    #[tokio::test]
    async fn test_udp_collector_one_datagram_per_event() {
        let (tx, mut rx) = mpsc::channel(16);
        let stats = Arc::new(Stats::new());
        let shutdown = CancellationToken::new();
        let addr = start_udp("127.0.0.1:0", "rfc3164", tx, Arc::clone(&stats), shutdown.clone())
            .await
            .unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket
            .send_to(b"<34>Oct 11 22:14:15 web1 su: datagram body", addr)
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        shutdown.cancel();

        assert_eq!(
            event.fields.get("message"),
            Some(&FieldValue::Text("datagram body".to_string()))
        );
        assert_eq!(
            event.fields.get("host"),
            Some(&FieldValue::Text("web1".to_string()))
        );
        assert_eq!(stats.snapshot().udp_events_rx, 1);
    }

    #[tokio::test]
    async fn test_tcp_parse_failure_counts_and_falls_back() {
        let (tx, mut rx) = mpsc::channel(16);
        let stats = Arc::new(Stats::new());
        let shutdown = CancellationToken::new();
        let addr = start_tcp("127.0.0.1:0", "rfc5424", None, tx, Arc::clone(&stats), shutdown.clone())
            .await
            .unwrap();

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"not syslog at all\n").await.unwrap();
        conn.shutdown().await.unwrap();

        let event = rx.recv().await.unwrap();
        shutdown.cancel();

        assert_eq!(
            event.fields.get("message"),
            Some(&FieldValue::Text("not syslog at all".to_string()))
        );
        assert_eq!(stats.snapshot().parse_failures, 1);
    }
}
