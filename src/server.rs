//! WebSocket + `/health` TCP listener: accept loop, per-connection
//! supervisor task, shared-port health probe, graceful shutdown
//! (SPEC_FULL.md §6, §6.1, §5).

use crate::connection::ConnectionState;
use crate::context::EngineContext;
use crate::handlers;
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

pub async fn run(ctx: EngineContext) -> Result<()> {
    let addr = format!("{}:{}", ctx.config.host, ctx.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "rtmd listening (WebSocket + HTTP health on same port)");

    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — draining connections and stopping");
                for conn in ctx.registry.list().await {
                    conn.teardown().await;
                }
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(err = %e, "accept error");
                        continue;
                    }
                };
                debug!(peer = %peer, "new connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, ctx).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    info!("rtmd stopped");
    Ok(())
}

/// Parse `appkey` out of the WebSocket upgrade request's query string
/// (`/v2?appkey=...`), SPEC_FULL.md §6 "Transport".
fn extract_appkey(query: Option<&str>) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            if key == "appkey" && !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: EngineContext) -> Result<()> {
    let mut peek_buf = [0u8; 12];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    if n >= 12 && &peek_buf[..12] == b"GET /health " {
        return handle_health_check(stream, &ctx).await;
    }

    let appkey_slot: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));
    let appkey_capture = appkey_slot.clone();
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        *appkey_capture.lock().unwrap() = extract_appkey(req.uri().query());
        Ok(resp)
    };

    let ws_config = WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        max_frame_size: Some(MAX_FRAME_SIZE),
        ..Default::default()
    };
    let ws = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;

    let appkey = match appkey_slot.lock().unwrap().clone() {
        Some(appkey) => appkey,
        None => {
            debug!(peer = %peer, "upgrade with no appkey, dropping");
            return Ok(());
        }
    };

    let (mut sink, mut stream) = ws.split();
    let (conn, mut rx) = ConnectionState::new(appkey, Some(peer), ctx.config.max_subscriptions);
    ctx.registry.register(conn.clone()).await;

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let handshake_deadline_conn = conn.clone();
    let handshake_timeout = ctx.config.handshake_timeout;
    tokio::spawn(async move {
        tokio::time::sleep(handshake_timeout).await;
        if !handshake_deadline_conn.is_authenticated() {
            handshake_deadline_conn.request_close();
        }
    });

    loop {
        tokio::select! {
            biased;

            _ = conn.close.notified() => {
                break;
            }

            frame = tokio::time::timeout(ctx.config.idle_timeout, stream.next()) => {
                match frame {
                    Err(_) => {
                        debug!(connection_id = %conn.connection_id, "idle timeout, closing");
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        warn!(connection_id = %conn.connection_id, err = %e, "ws error");
                        break;
                    }
                    Ok(Some(Ok(Message::Text(text)))) => {
                        let reply = handlers::handle_frame(&text, &conn, &ctx).await;
                        if !conn.send_frame(reply.to_text()) || !conn.is_ok() {
                            break;
                        }
                    }
                    Ok(Some(Ok(Message::Ping(data)))) => {
                        if !conn.send_path().send_raw(Message::Pong(data)) {
                            break;
                        }
                    }
                    Ok(Some(Ok(Message::Close(_)))) => break,
                    Ok(Some(Ok(_))) => {}
                }
            }
        }
    }

    conn.teardown().await;
    ctx.registry.unregister(&conn.connection_id).await;
    Ok(())
}

/// `GET /health` on the shared port (SPEC_FULL.md §6.1): not part of the RTM
/// envelope, a plain HTTP/1.1 response for operator liveness probes.
async fn handle_health_check(mut stream: TcpStream, ctx: &EngineContext) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut req_buf = [0u8; 256];
    let _ = stream.read(&mut req_buf).await;

    let uptime_secs = ctx.started_at.elapsed().as_secs();
    let connections = ctx.registry.len().await;
    let body = serde_json::json!({ "status": "ok", "uptime": uptime_secs, "connections": connections }).to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Resolves on SIGTERM (Unix) or Ctrl-C (any platform).
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
