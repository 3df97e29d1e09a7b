//! 統合テスト用ヘルパー
//!
//! 呼び出し回数を数えるオリジンサーバーと、レスポンス検査の小道具。

#![allow(dead_code)]

use gracegate::config::{BackendSection, ProxyConfig};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// テスト用オリジンのレスポンス定義
#[derive(Clone)]
pub struct OriginResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// レスポンスを返す前の遅延（collapsingテスト用）
    pub delay: Duration,
}

impl OriginResponse {
    pub fn ok(body: &[u8]) -> Self {
        Self {
            status: 200,
            headers: vec![
                ("Content-Type".to_string(), "text/html".to_string()),
                ("Cache-Control".to_string(), "max-age=300".to_string()),
            ],
            body: body.to_vec(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {} X\r\n", self.status).into_bytes();
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(b"Connection: close\r\n\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// 呼び出し回数を数えるオリジンサーバー
///
/// 接続ごとにスレッドを立て、リクエストを読み切ってから定義された
/// レスポンスを返して切断する
pub struct TestOrigin {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl TestOrigin {
    pub fn spawn(response: OriginResponse) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test origin");
        let addr = listener.local_addr().expect("local addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);

        thread::spawn(move || {
            for stream in listener.incoming() {
                let mut stream = match stream {
                    Ok(s) => s,
                    Err(_) => break,
                };
                let response = response.clone();
                let hits = Arc::clone(&hits_clone);
                thread::spawn(move || {
                    let mut buf = vec![0u8; 16 * 1024];
                    let mut received = Vec::new();
                    // ヘッダーが揃うまで読む
                    let header_end = loop {
                        match stream.read(&mut buf) {
                            Ok(0) => return,
                            Ok(n) => {
                                received.extend_from_slice(&buf[..n]);
                                if let Some(idx) = received.windows(4).position(|w| w == b"\r\n\r\n")
                                {
                                    break idx + 4;
                                }
                            }
                            Err(_) => return,
                        }
                    };

                    // ボディがあれば読み切ってから応答する
                    let content_length = content_length_of(&received[..header_end]);
                    while received.len() < header_end + content_length {
                        match stream.read(&mut buf) {
                            Ok(0) => return,
                            Ok(n) => received.extend_from_slice(&buf[..n]),
                            Err(_) => return,
                        }
                    }

                    hits.fetch_add(1, Ordering::SeqCst);
                    if !response.delay.is_zero() {
                        thread::sleep(response.delay);
                    }
                    let _ = stream.write_all(&response.to_bytes());
                });
            }
        });

        Self { addr, hits }
    }

    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

fn content_length_of(head: &[u8]) -> usize {
    let text = String::from_utf8_lossy(head);
    for line in text.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse().unwrap_or(0);
            }
        }
    }
    0
}

/// オリジン1台を向くゲートウェイ設定
pub fn config_for(origin: &TestOrigin) -> ProxyConfig {
    ProxyConfig {
        backend: vec![BackendSection {
            id: "origin01".to_string(),
            host: "127.0.0.1".to_string(),
            port: origin.addr.port(),
        }],
        ..ProxyConfig::default()
    }
}

// ====================
// レスポンス検査
// ====================

/// レスポンスバイト列からヘッダー値を取り出す
pub fn header_value(response: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(response);
    let head = text.split("\r\n\r\n").next()?;
    for line in head.lines().skip(1) {
        if let Some((n, v)) = line.split_once(':') {
            if n.trim().eq_ignore_ascii_case(name) {
                return Some(v.trim().to_string());
            }
        }
    }
    None
}

/// レスポンスのステータスコード
pub fn status_of(response: &[u8]) -> u16 {
    let text = String::from_utf8_lossy(response);
    text.split_whitespace().nth(1).and_then(|s| s.parse().ok()).unwrap_or(0)
}

/// レスポンスのボディ部分
pub fn body_of(response: &[u8]) -> Vec<u8> {
    let sep = response.windows(4).position(|w| w == b"\r\n\r\n");
    match sep {
        Some(idx) => response[idx + 4..].to_vec(),
        None => Vec::new(),
    }
}

/// monoioランタイムでテスト本体を実行
pub fn run_async<F>(future: F) -> F::Output
where
    F: std::future::Future,
{
    let mut rt = monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
        .enable_timer()
        .build()
        .expect("build test runtime");
    rt.block_on(future)
}
