//! バックエンドヘルスモニタ
//!
//! 専用スレッドで各バックエンドに定期プローブを送り、healthy/sickを
//! 判定します。リクエストパスはヘルス判定のためにネットワークへ
//! 出ることはなく、レジストリのフラグを読むだけです。

use crate::backend::{BackendRegistry, BackendTarget};
use crate::config::ProbeSection;
use ftlog::{info, warn};
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use monoio::time::timeout;
use monoio::RuntimeBuilder;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// 連続成功/失敗カウンタによるヘルス遷移判定
///
/// 単発の失敗でフラップしないよう、しきい値回数の連続観測で初めて
/// 状態を切り替える
pub struct HealthTracker {
    failure_threshold: u32,
    success_threshold: u32,
    consecutive_failures: u32,
    consecutive_successes: u32,
    healthy: bool,
}

impl HealthTracker {
    pub fn new(failure_threshold: u32, success_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            consecutive_failures: 0,
            consecutive_successes: 0,
            healthy: true,
        }
    }

    #[inline]
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// プローブ結果を記録し、状態が切り替わったらtrueを返す
    pub fn record(&mut self, success: bool) -> bool {
        if success {
            self.consecutive_failures = 0;
            self.consecutive_successes += 1;
            if !self.healthy && self.consecutive_successes >= self.success_threshold {
                self.healthy = true;
                return true;
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures += 1;
            if self.healthy && self.consecutive_failures >= self.failure_threshold {
                self.healthy = false;
                return true;
            }
        }
        false
    }
}

/// プローブを1回実行
///
/// TCP接続してGETを送り、2xx/3xxが返ればhealthy
async fn probe_once(target: &BackendTarget, path: &str, probe_timeout: Duration) -> bool {
    let addr = target.addr();

    let mut stream = match timeout(probe_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(s)) => s,
        _ => return false,
    };

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: gracegate-probe\r\nConnection: close\r\n\r\n",
        path, target.host
    );

    let (write_result, _) = match timeout(probe_timeout, stream.write_all(request.into_bytes())).await {
        Ok(r) => r,
        Err(_) => return false,
    };
    if write_result.is_err() {
        return false;
    }

    // ステータスラインが読めれば十分
    let buf = vec![0u8; 1024];
    let (read_result, buf) = match timeout(probe_timeout, stream.read(buf)).await {
        Ok(r) => r,
        Err(_) => return false,
    };
    let n = match read_result {
        Ok(n) if n > 0 => n,
        _ => return false,
    };

    status_is_passing(&buf[..n])
}

/// ステータスラインから2xx/3xxかどうかを判定
fn status_is_passing(head: &[u8]) -> bool {
    let mut headers = [httparse::EMPTY_HEADER; 8];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(head) {
        Ok(_) => matches!(response.code, Some(code) if (200..400).contains(&code)),
        Err(_) => false,
    }
}

/// バックエンド1台分のプローブループ
async fn probe_loop(
    target: Arc<BackendTarget>,
    probe: ProbeSection,
    shutdown: &'static AtomicBool,
) {
    let mut tracker = HealthTracker::new(probe.failure_threshold, probe.success_threshold);

    while !shutdown.load(Ordering::Relaxed) {
        let success = probe_once(&target, &probe.path, probe.timeout()).await;

        if tracker.record(success) {
            target.set_healthy(tracker.is_healthy());
            if tracker.is_healthy() {
                info!("backend {} is healthy again", target.id);
            } else {
                warn!("backend {} marked sick", target.id);
            }
        }

        monoio::time::sleep(probe.interval()).await;
    }
}

/// ヘルスモニタスレッドを起動
///
/// 専用スレッド上のランタイムでバックエンドごとのプローブタスクを走らせる
pub fn spawn_monitor(
    registry: Arc<BackendRegistry>,
    probe: ProbeSection,
    shutdown: &'static AtomicBool,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("health-monitor".to_string())
        .spawn(move || {
            let mut rt = match RuntimeBuilder::<monoio::FusionDriver>::new()
                .enable_timer()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    warn!("health monitor runtime failed to start: {}", e);
                    return;
                }
            };

            rt.block_on(async {
                for target in registry.targets() {
                    monoio::spawn(probe_loop(Arc::clone(target), probe.clone(), shutdown));
                }

                // シャットダウンフラグの監視だけ残す
                while !shutdown.load(Ordering::Relaxed) {
                    monoio::time::sleep(Duration::from_millis(200)).await;
                }
            });
        })
        .expect("failed to spawn health monitor thread")
}
