//! gracegate エントリポイント
//!
//! スレッドごとに独立したランタイムとSO_REUSEPORTリスナーを持つ
//! thread-per-core構成で動きます。ヘルスモニタは専用スレッドです。

use ftlog::{error, info, warn};
use gracegate::config::ProxyConfig;
use gracegate::health;
use gracegate::http::{self, ParseOutcome};
use gracegate::proxy::Gateway;
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::{TcpListener, TcpStream};
use monoio::time::timeout;
use monoio::RuntimeBuilder;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use time::OffsetDateTime;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// クライアント接続の読み込みタイムアウト
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// クライアントへの書き込みタイムアウト
const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
/// クライアントボディの上限
const MAX_CLIENT_BODY: usize = 16 * 1024 * 1024;
/// ハウスキーピング間隔
const HOUSEKEEP_INTERVAL: Duration = Duration::from_secs(60);

static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);

fn main() {
    let _guard = match ftlog::Builder::new().try_init() {
        Ok(g) => g,
        Err(e) => {
            eprintln!("Logger init error: {}", e);
            return;
        }
    };

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = match ProxyConfig::load(Path::new(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config load error ({}): {}", config_path, e);
            return;
        }
    };

    let listen_addr = match config.server.listen.parse::<SocketAddr>() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Invalid listen address '{}': {}", config.server.listen, e);
            return;
        }
    };

    let gateway = match Gateway::new(&config) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("Gateway init error: {}", e);
            return;
        }
    };

    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());

    info!("============================================");
    info!("gracegate - stale-tolerant caching gateway");
    info!("Hostname: {}", hostname);
    info!("Listen Address: {}", listen_addr);
    info!("Threads: {}", num_cpus::get());
    info!("Backends: {}", config.backend.len());
    for backend in &config.backend {
        info!("  {} -> {}:{}", backend.id, backend.host, backend.port);
    }
    info!(
        "Cache Windows: ttl={}s grace={}s keep={}s",
        config.cache.default_ttl_secs, config.cache.default_grace_secs, config.cache.default_keep_secs
    );
    info!("Memory Budget: {} bytes", config.cache.memory_budget_bytes);
    info!("============================================");

    setup_signal_handler();

    // ヘルスモニタは専用スレッド
    let monitor_handle =
        health::spawn_monitor(gateway.registry(), config.probe.clone(), &SHUTDOWN_FLAG);

    let num_threads = num_cpus::get();
    let mut handles = Vec::with_capacity(num_threads);

    for thread_id in 0..num_threads {
        let gateway = Arc::clone(&gateway);
        let addr = listen_addr;

        let handle = thread::spawn(move || {
            let mut rt = match RuntimeBuilder::<monoio::FusionDriver>::new()
                .enable_timer()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("[Thread {}] Runtime error: {}", thread_id, e);
                    return;
                }
            };
            rt.block_on(async move {
                let listener = match create_listener(addr) {
                    Ok(l) => l,
                    Err(e) => {
                        error!("[Thread {}] Bind error: {}", thread_id, e);
                        return;
                    }
                };

                info!("[Thread {}] Worker started", thread_id);

                // ハウスキーピングは1スレッドだけ
                if thread_id == 0 {
                    let gw = Arc::clone(&gateway);
                    monoio::spawn(async move {
                        while !SHUTDOWN_FLAG.load(Ordering::Relaxed) {
                            monoio::time::sleep(HOUSEKEEP_INTERVAL).await;
                            gw.housekeep();
                        }
                    });
                }

                loop {
                    if SHUTDOWN_FLAG.load(Ordering::Relaxed) {
                        info!("[Thread {}] Shutting down...", thread_id);
                        break;
                    }

                    // タイムアウト付きaccept（Graceful Shutdown対応）
                    let accept_result = timeout(Duration::from_secs(1), listener.accept()).await;

                    let (stream, peer_addr) = match accept_result {
                        Ok(Ok(s)) => s,
                        Ok(Err(e)) => {
                            error!("[Thread {}] Accept error: {}", thread_id, e);
                            continue;
                        }
                        Err(_) => {
                            // タイムアウト - ループを継続してshutdownチェック
                            continue;
                        }
                    };

                    let _ = stream.set_nodelay(true);

                    let gateway = Arc::clone(&gateway);
                    monoio::spawn(async move {
                        handle_connection(stream, gateway, peer_addr).await;
                    });
                }

                info!("[Thread {}] Worker stopped", thread_id);
            });
        });
        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }
    let _ = monitor_handle.join();

    info!("Server shutdown complete");
}

fn setup_signal_handler() {
    // SIGINT, SIGTERM をキャッチしてシャットダウンフラグを設定
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal, initiating graceful shutdown...");
        SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
    }) {
        warn!("Failed to set signal handler: {}", e);
    }
}

fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let config = monoio::net::ListenerConfig::default()
        .reuse_port(true)
        .backlog(8192);
    TcpListener::bind_with_config(addr, &config)
}

// ====================
// 接続処理
// ====================

async fn handle_connection(mut stream: TcpStream, gateway: Arc<Gateway>, peer_addr: SocketAddr) {
    let mut buffer: Vec<u8> = Vec::with_capacity(8 * 1024);

    loop {
        // ヘッダーが揃うまで読む
        let request = loop {
            match http::parse_request(&buffer) {
                ParseOutcome::Complete(r) => break r,
                ParseOutcome::Invalid => {
                    let _ = timeout(
                        CLIENT_WRITE_TIMEOUT,
                        stream.write_all(http::ERR_BAD_REQUEST.to_vec()),
                    )
                    .await;
                    return;
                }
                ParseOutcome::Partial => {}
            }

            if buffer.len() > http::MAX_HEADER_SIZE {
                let _ = timeout(
                    CLIENT_WRITE_TIMEOUT,
                    stream.write_all(http::ERR_HEADER_TOO_LARGE.to_vec()),
                )
                .await;
                return;
            }

            let chunk = vec![0u8; 8 * 1024];
            let (read_result, chunk) = match timeout(CLIENT_READ_TIMEOUT, stream.read(chunk)).await
            {
                Ok(r) => r,
                Err(_) => return,
            };
            match read_result {
                Ok(0) => return, // クライアント切断
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(_) => return,
            }
        };

        // chunkedなクライアントボディは受けない
        if request.is_chunked() {
            let _ = timeout(
                CLIENT_WRITE_TIMEOUT,
                stream.write_all(http::ERR_LENGTH_REQUIRED.to_vec()),
            )
            .await;
            return;
        }

        let content_length = request.content_length().unwrap_or(0);
        if content_length > MAX_CLIENT_BODY {
            let _ = timeout(
                CLIENT_WRITE_TIMEOUT,
                stream.write_all(http::ERR_BAD_REQUEST.to_vec()),
            )
            .await;
            return;
        }

        // ボディを読み切る
        let mut body = buffer[request.header_len..].to_vec();
        while body.len() < content_length {
            let chunk = vec![0u8; 8 * 1024];
            let (read_result, chunk) = match timeout(CLIENT_READ_TIMEOUT, stream.read(chunk)).await
            {
                Ok(r) => r,
                Err(_) => return,
            };
            match read_result {
                Ok(0) => return,
                Ok(n) => body.extend_from_slice(&chunk[..n]),
                Err(_) => return,
            }
        }
        // 次のリクエストの先読み分を持ち越す
        let leftover = body.split_off(content_length.min(body.len()));
        buffer = leftover;

        let start_time = OffsetDateTime::now_utc();
        let keep_alive = request.keep_alive;
        let target = request.target.clone();
        let request_body_size = body.len() as u64;

        let handled = gateway.handle(&request, body, peer_addr.ip()).await;

        let response_size = handled.bytes.len() as u64;
        let (write_result, _) = match timeout(
            CLIENT_WRITE_TIMEOUT,
            stream.write_all(handled.bytes),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => return,
        };

        log_access(
            peer_addr,
            &request.method,
            &target,
            handled.status_code,
            handled.cache_label,
            request_body_size,
            response_size,
            start_time,
        );

        if write_result.is_err() || !keep_alive {
            return;
        }
    }
}

// ====================
// ロギング
// ====================

#[allow(clippy::too_many_arguments)]
fn log_access(
    peer: SocketAddr,
    method: &[u8],
    target: &str,
    status: u16,
    cache: &str,
    req_body_size: u64,
    resp_size: u64,
    start_time: OffsetDateTime,
) {
    let end_time = OffsetDateTime::now_utc();
    let duration_ms = (end_time - start_time).whole_milliseconds();
    let method_str = std::str::from_utf8(method).unwrap_or("-");

    info!(
        "Access: peer={} method={} target={} status={} cache={} duration={}ms req_body_size={} resp_size={}",
        peer, method_str, target, status, cache, duration_ms, req_body_size, resp_size
    );
}
