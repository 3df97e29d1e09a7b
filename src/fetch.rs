//! フェッチコーディネータ
//!
//! オリジンへのフェッチと、同一キーに対する同時フェッチの合流
//! （request collapsing）を担当します。合流はDashMapに登録した
//! 進行中スロットで行い、後着のリクエストはスロットの完了を待って
//! 同じ結果を受け取ります。
//!
//! ワーカーはスレッドごとに独立したランタイムを持つため、スレッドを
//! またぐ起床通知は使えません。待機側は短い間隔でスロットをポーリング
//! します。

use crate::backend::BackendRegistry;
use crate::cache::key::{CacheKey, CacheableMethod};
use crate::cache::object::CacheObject;
use crate::cache::policy::{PolicyResolver, StorePolicy};
use crate::cache::store::ObjectStore;
use crate::classify::RouteClass;
use crate::config::TimeoutSection;
use crate::http::{self, ChunkedDecoder, ResponseParseOutcome};
use dashmap::DashMap;
use ftlog::debug;
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use monoio::time::timeout;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// フェッチで許容するボディの上限
const MAX_FETCH_BODY: usize = 64 * 1024 * 1024;
/// 読み込みチャンクサイズ
const READ_CHUNK: usize = 16 * 1024;
/// 合流待機のポーリング間隔
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// フェッチ失敗の種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchError {
    /// healthyなバックエンドがいない
    NoHealthyBackend,
    /// 接続失敗
    Connect,
    /// タイムアウト
    Timeout,
    /// 読み書きエラー
    Io,
    /// 解析不能なレスポンス
    Malformed,
    /// ボディが大きすぎる
    BodyTooLarge,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FetchError::NoHealthyBackend => "no healthy backend",
            FetchError::Connect => "connect failed",
            FetchError::Timeout => "timeout",
            FetchError::Io => "io error",
            FetchError::Malformed => "malformed response",
            FetchError::BodyTooLarge => "body too large",
        };
        f.write_str(s)
    }
}

impl std::error::Error for FetchError {}

/// オリジンから受け取ったレスポンス（格納対象外の配信用）
#[derive(Debug)]
pub struct FetchedResponse {
    pub status_code: u16,
    pub headers: Vec<(Box<[u8]>, Box<[u8]>)>,
    pub body: Vec<u8>,
    pub backend_id: Box<str>,
}

/// フェッチの結果
///
/// 合流した全リクエストに同じ値が配られる
#[derive(Clone)]
pub enum FetchOutcome {
    /// ストアに格納された
    Stored(Arc<CacheObject>),
    /// ポリシー上格納しない。このまま配信だけする
    Uncached(Arc<FetchedResponse>),
    /// 失敗
    Failed(FetchError),
}

/// 進行中フェッチのスロット
///
/// オーナーが結果を書き込んでdoneを立てる。待機側はdoneをポーリングする
struct PendingFetch {
    done: AtomicBool,
    slot: OnceLock<FetchOutcome>,
}

impl PendingFetch {
    fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            slot: OnceLock::new(),
        }
    }

    fn complete(&self, outcome: FetchOutcome) {
        let _ = self.slot.set(outcome);
        self.done.store(true, Ordering::Release);
    }
}

/// フェッチコーディネータ
pub struct FetchCoordinator {
    store: Arc<ObjectStore>,
    registry: Arc<BackendRegistry>,
    policy: PolicyResolver,
    timeouts: TimeoutSection,
    /// キーのハッシュ → 進行中フェッチ
    in_flight: DashMap<u64, Arc<PendingFetch>>,
}

impl FetchCoordinator {
    pub fn new(
        store: Arc<ObjectStore>,
        registry: Arc<BackendRegistry>,
        policy: PolicyResolver,
        timeouts: TimeoutSection,
    ) -> Self {
        Self {
            store,
            registry,
            policy,
            timeouts,
            in_flight: DashMap::new(),
        }
    }

    /// 現在進行中のフェッチ数
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// キャッシュ充填フェッチ（合流つき)
    ///
    /// 同一キーのフェッチが進行中なら、その結果を待って共有する。
    /// `previous`があれば条件付きリクエストで再検証し、304なら手元の
    /// ボディでオブジェクトを作り直す
    pub async fn fetch(
        &self,
        key: CacheKey,
        route: RouteClass,
        previous: Option<Arc<CacheObject>>,
    ) -> FetchOutcome {
        let hash = key.hash_value();

        let pending = match self.in_flight.entry(hash) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                // 進行中のフェッチに合流する
                let pending = Arc::clone(entry.get());
                drop(entry);
                debug!("collapsing request for {}", key.canonical());
                return self.wait_for(pending).await;
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let pending = Arc::new(PendingFetch::new());
                entry.insert(Arc::clone(&pending));
                pending
            }
        };

        // ここから先はオーナーとして必ずスロットを完了させる
        let outcome = self.fetch_origin(&key, route, previous.as_deref()).await;
        pending.complete(outcome.clone());
        self.in_flight.remove(&hash);

        outcome
    }

    /// 進行中フェッチの完了を待つ
    async fn wait_for(&self, pending: Arc<PendingFetch>) -> FetchOutcome {
        let deadline = self.total_fetch_timeout();
        let start = Instant::now();

        while !pending.done.load(Ordering::Acquire) {
            if start.elapsed() > deadline {
                return FetchOutcome::Failed(FetchError::Timeout);
            }
            monoio::time::sleep(WAIT_POLL_INTERVAL).await;
        }

        pending
            .slot
            .get()
            .cloned()
            .unwrap_or(FetchOutcome::Failed(FetchError::Timeout))
    }

    /// フェッチ全体の上限時間
    fn total_fetch_timeout(&self) -> Duration {
        self.timeouts.connect() + self.timeouts.first_byte() + self.timeouts.idle()
            + Duration::from_secs(1)
    }

    /// オリジンに1回フェッチして結果を格納/返却する
    async fn fetch_origin(
        &self,
        key: &CacheKey,
        route: RouteClass,
        previous: Option<&CacheObject>,
    ) -> FetchOutcome {
        let target = match self.registry.pick_healthy() {
            Some(t) => t,
            None => return FetchOutcome::Failed(FetchError::NoHealthyBackend),
        };

        let mut request = Vec::with_capacity(256);
        request.extend_from_slice(key.method().as_str().as_bytes());
        request.push(b' ');
        request.extend_from_slice(key.request_target().as_bytes());
        request.extend_from_slice(b" HTTP/1.1\r\nHost: ");
        request.extend_from_slice(key.host().as_bytes());
        request.extend_from_slice(b"\r\nUser-Agent: gracegate\r\nAccept-Encoding: identity\r\n");

        // 手元にバリデータがあれば条件付きで再検証
        if let Some(prev) = previous {
            if let Some(etag) = &prev.etag {
                request.extend_from_slice(b"If-None-Match: ");
                request.extend_from_slice(etag.as_bytes());
                request.extend_from_slice(b"\r\n");
            } else if let Some(lm) = &prev.last_modified {
                request.extend_from_slice(b"If-Modified-Since: ");
                request.extend_from_slice(lm.as_bytes());
                request.extend_from_slice(b"\r\n");
            }
        }
        request.extend_from_slice(b"Connection: close\r\n\r\n");

        let expect_body = key.method() == CacheableMethod::Get;
        let response = match self.roundtrip(&target.addr(), request, expect_body).await {
            Ok(r) => r,
            Err(e) => return FetchOutcome::Failed(e),
        };

        // 304: 手元のボディをそのまま使ってウィンドウを引き直す
        if response.status_code == 304 {
            if let Some(prev) = previous {
                return self.store_revalidated(key, route, prev, &target.id);
            }
            return FetchOutcome::Failed(FetchError::Malformed);
        }

        match self.policy.resolve(route, response.status_code, &response.headers) {
            StorePolicy::Store {
                ttl_secs,
                grace_secs,
                keep_secs,
                strip_set_cookie,
            } => {
                let headers: Vec<(Box<[u8]>, Box<[u8]>)> = if strip_set_cookie {
                    response
                        .headers
                        .into_iter()
                        .filter(|(n, _)| !n.eq_ignore_ascii_case(b"set-cookie"))
                        .collect()
                } else {
                    response.headers
                };

                let object = Arc::new(CacheObject::new(
                    response.status_code,
                    headers,
                    response.body,
                    ttl_secs,
                    grace_secs,
                    keep_secs,
                    &target.id,
                ));
                self.store.insert(key.clone(), Arc::clone(&object));
                FetchOutcome::Stored(object)
            }
            StorePolicy::DontStore => FetchOutcome::Uncached(Arc::new(FetchedResponse {
                status_code: response.status_code,
                headers: response.headers,
                body: response.body,
                backend_id: Box::from(&*target.id),
            })),
        }
    }

    /// 304を受けて既存オブジェクトを焼き直す
    fn store_revalidated(
        &self,
        key: &CacheKey,
        route: RouteClass,
        prev: &CacheObject,
        backend_id: &str,
    ) -> FetchOutcome {
        match self.policy.resolve(route, prev.status_code, &prev.headers) {
            StorePolicy::Store {
                ttl_secs,
                grace_secs,
                keep_secs,
                ..
            } => {
                let object = Arc::new(CacheObject::new(
                    prev.status_code,
                    prev.headers.to_vec(),
                    prev.body.to_vec(),
                    ttl_secs,
                    grace_secs,
                    keep_secs,
                    backend_id,
                ));
                self.store.insert(key.clone(), Arc::clone(&object));
                FetchOutcome::Stored(object)
            }
            // 格納ポリシーが変わっていたら手元のコピーも消す
            StorePolicy::DontStore => {
                self.store.purge(key);
                FetchOutcome::Failed(FetchError::Malformed)
            }
        }
    }

    /// 素通しリクエストをオリジンへ中継する
    ///
    /// 合流もストアも通さない。リクエストバイト列は呼び出し側が組み立てる
    pub async fn passthrough(&self, request: Vec<u8>) -> Result<FetchedResponse, FetchError> {
        let target = match self.registry.pick_healthy() {
            Some(t) => t,
            None => return Err(FetchError::NoHealthyBackend),
        };

        let response = self.roundtrip(&target.addr(), request, true).await?;
        Ok(FetchedResponse {
            status_code: response.status_code,
            headers: response.headers,
            body: response.body,
            backend_id: Box::from(&*target.id),
        })
    }

    /// 接続してリクエストを送り、レスポンスを読み切る
    async fn roundtrip(
        &self,
        addr: &str,
        request: Vec<u8>,
        expect_body: bool,
    ) -> Result<FetchedResponse, FetchError> {
        let mut stream = match timeout(self.timeouts.connect(), TcpStream::connect(addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(_)) => return Err(FetchError::Connect),
            Err(_) => return Err(FetchError::Timeout),
        };

        let (write_result, _) = match timeout(self.timeouts.idle(), stream.write_all(request)).await
        {
            Ok(r) => r,
            Err(_) => return Err(FetchError::Timeout),
        };
        if write_result.is_err() {
            return Err(FetchError::Io);
        }

        // ヘッダーが揃うまで読む。先頭バイトだけ長めのタイムアウト
        let mut received: Vec<u8> = Vec::with_capacity(READ_CHUNK);
        let head = loop {
            let read_timeout = if received.is_empty() {
                self.timeouts.first_byte()
            } else {
                self.timeouts.idle()
            };

            let chunk = vec![0u8; READ_CHUNK];
            let (read_result, chunk) = match timeout(read_timeout, stream.read(chunk)).await {
                Ok(r) => r,
                Err(_) => return Err(FetchError::Timeout),
            };
            let n = match read_result {
                Ok(0) => return Err(FetchError::Malformed),
                Ok(n) => n,
                Err(_) => return Err(FetchError::Io),
            };
            received.extend_from_slice(&chunk[..n]);

            if received.len() > http::MAX_HEADER_SIZE + MAX_FETCH_BODY {
                return Err(FetchError::BodyTooLarge);
            }

            match http::parse_response_head(&received) {
                ResponseParseOutcome::Complete(head) => break head,
                ResponseParseOutcome::Partial => continue,
                ResponseParseOutcome::Invalid => return Err(FetchError::Malformed),
            }
        };

        let mut body_so_far = received[head.header_len..].to_vec();

        // HEADや204/304にはボディがない
        let has_body = expect_body && head.status_code != 204 && head.status_code != 304;
        if !has_body {
            return Ok(FetchedResponse {
                status_code: head.status_code,
                headers: head.headers,
                body: Vec::new(),
                backend_id: Box::from(""),
            });
        }

        let body = if head.is_chunked {
            let mut decoder = ChunkedDecoder::new();
            let mut done = decoder.push(&body_so_far).map_err(|_| FetchError::Malformed)?;
            while !done {
                let chunk = vec![0u8; READ_CHUNK];
                let (read_result, chunk) =
                    match timeout(self.timeouts.idle(), stream.read(chunk)).await {
                        Ok(r) => r,
                        Err(_) => return Err(FetchError::Timeout),
                    };
                let n = match read_result {
                    Ok(0) => return Err(FetchError::Malformed),
                    Ok(n) => n,
                    Err(_) => return Err(FetchError::Io),
                };
                done = decoder.push(&chunk[..n]).map_err(|_| FetchError::Malformed)?;
                if decoder.body_len() > MAX_FETCH_BODY {
                    return Err(FetchError::BodyTooLarge);
                }
            }
            decoder.into_body()
        } else if let Some(content_length) = head.content_length {
            if content_length > MAX_FETCH_BODY {
                return Err(FetchError::BodyTooLarge);
            }
            while body_so_far.len() < content_length {
                let chunk = vec![0u8; READ_CHUNK];
                let (read_result, chunk) =
                    match timeout(self.timeouts.idle(), stream.read(chunk)).await {
                        Ok(r) => r,
                        Err(_) => return Err(FetchError::Timeout),
                    };
                let n = match read_result {
                    Ok(0) => return Err(FetchError::Malformed),
                    Ok(n) => n,
                    Err(_) => return Err(FetchError::Io),
                };
                body_so_far.extend_from_slice(&chunk[..n]);
            }
            body_so_far.truncate(content_length);
            body_so_far
        } else {
            // Content-Lengthなし: Connection: closeで送ったのでEOFまで読む
            loop {
                let chunk = vec![0u8; READ_CHUNK];
                let (read_result, chunk) =
                    match timeout(self.timeouts.idle(), stream.read(chunk)).await {
                        Ok(r) => r,
                        Err(_) => return Err(FetchError::Timeout),
                    };
                match read_result {
                    Ok(0) => break,
                    Ok(n) => {
                        body_so_far.extend_from_slice(&chunk[..n]);
                        if body_so_far.len() > MAX_FETCH_BODY {
                            return Err(FetchError::BodyTooLarge);
                        }
                    }
                    Err(_) => return Err(FetchError::Io),
                }
            }
            body_so_far
        };

        Ok(FetchedResponse {
            status_code: head.status_code,
            headers: head.headers,
            body,
            backend_id: Box::from(""),
        })
    }
}
