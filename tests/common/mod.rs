/// Common utilities for integration tests
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_tunnel::config::{ServeMode, TunnelConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Build a tunnel configuration pointing at a local relay endpoint
pub fn tunnel_config(
    listen_port: u16,
    dest_port: u16,
    mode: ServeMode,
    headers: &str,
    relay_methods: &str,
) -> TunnelConfig {
    TunnelConfig {
        local_addr: format!("127.0.0.1:{}", listen_port),
        dest_addr: format!("127.0.0.1:{}", dest_port),
        headers: headers.to_string(),
        relay_methods: relay_methods.to_string(),
        mode,
    }
}

/// Start a fake relay endpoint.
///
/// Connections whose first request is a CONNECT get a 200 response and
/// are echoed afterwards. Any other request is treated as a relayed HTTP
/// request: every byte received on the connection is appended to
/// `relay_capture` and nothing is sent back.
pub async fn start_relay_endpoint(
    port: u16,
    relay_capture: Arc<Mutex<Vec<u8>>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let listener = TokioTcpListener::bind(format!("127.0.0.1:{}", port))
            .await
            .expect("Failed to bind relay endpoint");

        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let capture = Arc::clone(&relay_capture);
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 8192];
                        let mut acc: Vec<u8> = Vec::new();

                        // Read the request head first
                        let header_end = loop {
                            let n = match socket.read(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => n,
                            };
                            acc.extend_from_slice(&buf[..n]);
                            if let Some(i) = find(&acc, b"\r\n\r\n") {
                                break i;
                            }
                        };

                        if acc.starts_with(b"CONNECT ") {
                            if socket
                                .write_all(b"HTTP/1.0 200 Connection established\r\n\r\n")
                                .await
                                .is_err()
                            {
                                return;
                            }
                            // Tunnel data pipelined behind the request head
                            let leftover = acc[header_end + 4..].to_vec();
                            if !leftover.is_empty()
                                && socket.write_all(&leftover).await.is_err()
                            {
                                return;
                            }
                            loop {
                                match socket.read(&mut buf).await {
                                    Ok(0) | Err(_) => break,
                                    Ok(n) => {
                                        if socket.write_all(&buf[..n]).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                        } else {
                            capture.lock().unwrap().extend_from_slice(&acc);
                            loop {
                                match socket.read(&mut buf).await {
                                    Ok(0) | Err(_) => break,
                                    Ok(n) => {
                                        capture.lock().unwrap().extend_from_slice(&buf[..n]);
                                    }
                                }
                            }
                        }
                    });
                }
                Err(_) => break,
            }
        }
    })
}

/// Start a relay endpoint that rejects every CONNECT with the given status line
pub async fn start_rejecting_relay(
    port: u16,
    status_line: &'static str,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let listener = TokioTcpListener::bind(format!("127.0.0.1:{}", port))
            .await
            .expect("Failed to bind rejecting relay");

        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 8192];
                        let mut acc: Vec<u8> = Vec::new();
                        loop {
                            let n = match socket.read(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => n,
                            };
                            acc.extend_from_slice(&buf[..n]);
                            if find(&acc, b"\r\n\r\n").is_some() {
                                break;
                            }
                        }
                        let _ = socket
                            .write_all(format!("{}\r\n\r\n", status_line).as_bytes())
                            .await;
                    });
                }
                Err(_) => break,
            }
        }
    })
}

/// Wait for server to be ready
pub async fn wait_for_server(port: u16, max_attempts: u32) -> bool {
    for _ in 0..max_attempts {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

/// Poll a condition until it holds or the deadline passes
pub async fn wait_until(cond: impl Fn() -> bool, max_wait: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + max_wait;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
