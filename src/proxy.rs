//! ゲートウェイ本体
//!
//! リクエスト1件を受け取り、分類 → キー導出 → ルックアップ → 鮮度判定 →
//! 配信/フェッチ/再検証のオーケストレーションを行います。管理操作
//! （PURGE/BAN）の受付とACL判定もここで行います。

use crate::backend::BackendRegistry;
use crate::cache::ban::BanList;
use crate::cache::key::CacheKey;
use crate::cache::object::{now_unix, CacheObject};
use crate::cache::policy::PolicyResolver;
use crate::cache::state::{decide, CacheStatus, Freshness, LookupAction};
use crate::cache::store::ObjectStore;
use crate::classify::{Classifier, Decision, RouteClass};
use crate::config::ProxyConfig;
use crate::fetch::{FetchCoordinator, FetchError, FetchOutcome, FetchedResponse};
use crate::http::{self, ParsedRequest};
use ftlog::{debug, info, warn};
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

/// 処理結果
///
/// レスポンスバイト列とアクセスログ用のメタデータ
pub struct Handled {
    pub bytes: Vec<u8>,
    pub status_code: u16,
    pub cache_label: &'static str,
}

impl Handled {
    fn new(bytes: Vec<u8>, status_code: u16, cache_label: &'static str) -> Self {
        Self {
            bytes,
            status_code,
            cache_label,
        }
    }

    fn error(bytes: &'static [u8], status_code: u16) -> Self {
        Self::new(bytes.to_vec(), status_code, "ERROR")
    }
}

/// ゲートウェイ
pub struct Gateway {
    classifier: Classifier,
    store: Arc<ObjectStore>,
    bans: BanList,
    registry: Arc<BackendRegistry>,
    coordinator: Arc<FetchCoordinator>,
    admin_allowlist: Vec<IpAddr>,
}

impl Gateway {
    /// 設定から構築
    pub fn new(config: &ProxyConfig) -> io::Result<Arc<Self>> {
        let classifier = Classifier::new(&config.classifier, &config.cache)?;
        let store = Arc::new(ObjectStore::new(config.cache.memory_budget_bytes));
        let registry = Arc::new(BackendRegistry::from_config(&config.backend));
        let coordinator = Arc::new(FetchCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            PolicyResolver::new(config.cache.clone()),
            config.timeouts.clone(),
        ));

        Ok(Arc::new(Self {
            classifier,
            store,
            bans: BanList::new(config.cache.max_lifetime_secs()),
            registry,
            coordinator,
            admin_allowlist: config.admin.parsed_allowlist()?,
        }))
    }

    /// バックエンドレジストリ（ヘルスモニタ起動用）
    pub fn registry(&self) -> Arc<BackendRegistry> {
        Arc::clone(&self.registry)
    }

    /// オブジェクトストア
    pub fn store(&self) -> Arc<ObjectStore> {
        Arc::clone(&self.store)
    }

    /// 定期ハウスキーピング
    ///
    /// 全ウィンドウ切れのオブジェクトと不要になったBANルールを掃除する
    pub fn housekeep(&self) {
        let now = now_unix();
        let swept = self.store.sweep_expired(now);
        self.bans.compact(now);
        if swept > 0 {
            debug!("housekeeping swept {} expired objects", swept);
        }
    }

    /// 管理操作が許可された送信元か
    fn is_admin_allowed(&self, peer: IpAddr) -> bool {
        self.admin_allowlist.contains(&peer)
    }

    /// リクエスト1件を処理
    pub async fn handle(&self, request: &ParsedRequest, body: Vec<u8>, peer: IpAddr) -> Handled {
        // 管理操作はメソッドで受ける
        if request.method.eq_ignore_ascii_case(b"PURGE") {
            return self.handle_purge(request, peer);
        }
        if request.method.eq_ignore_ascii_case(b"BAN") {
            return self.handle_ban(request, peer);
        }

        let cookie = request.header(b"cookie");
        let has_authorization = request.header(b"authorization").is_some();

        match self
            .classifier
            .classify(&request.method, &request.path, cookie, has_authorization)
        {
            Decision::Cacheable(route) => self.handle_cacheable(request, route).await,
            Decision::Pass(reason) => {
                debug!("pass ({}) {}", reason.as_str(), request.target);
                self.handle_pass(request, body).await
            }
        }
    }

    // ====================
    // キャッシュ経路
    // ====================

    async fn handle_cacheable(&self, request: &ParsedRequest, route: RouteClass) -> Handled {
        let host = match request.host() {
            Some(h) => h,
            None => return Handled::error(http::ERR_BAD_REQUEST, 400),
        };

        let key = match CacheKey::from_request(
            &request.method,
            host,
            &request.target,
            self.classifier.tracking_params(),
        ) {
            Some(k) => k,
            None => return Handled::error(http::ERR_BAD_REQUEST, 400),
        };

        let include_body = !request.method.eq_ignore_ascii_case(b"HEAD");
        let keep_alive = request.keep_alive;
        let now = now_unix();

        // ルックアップ + 遅延BAN判定
        let mut object = self.store.lookup(&key);
        if let Some(obj) = &object {
            if self.bans.is_banned(&key.canonical(), obj.created_unix) {
                self.store.purge(&key);
                object = None;
            }
        }

        let freshness = object.as_ref().map(|o| Freshness::of(o, now));
        let healthy = self.registry.any_healthy();

        match decide(freshness, healthy) {
            LookupAction::Deliver(status) => {
                // unwrapしない: decideがDeliverを返すのはobjectがある場合だけ
                match object {
                    Some(obj) => self.deliver_cached(&obj, status, now, include_body, keep_alive),
                    None => Handled::error(http::ERR_BAD_REQUEST, 400),
                }
            }

            LookupAction::DeliverAndRevalidate => {
                let obj = match object {
                    Some(o) => o,
                    None => return Handled::error(http::ERR_BAD_REQUEST, 400),
                };

                // stale配信しつつバックグラウンドで焼き直す
                let coordinator = Arc::clone(&self.coordinator);
                let bg_key = key.clone();
                let bg_prev = Arc::clone(&obj);
                monoio::spawn(async move {
                    if let FetchOutcome::Failed(e) =
                        coordinator.fetch(bg_key, route, Some(bg_prev)).await
                    {
                        debug!("background revalidation failed: {}", e);
                    }
                });

                self.deliver_cached(&obj, CacheStatus::StaleGrace, now, include_body, keep_alive)
            }

            LookupAction::RevalidateBlocking => {
                let obj = match object {
                    Some(o) => o,
                    None => return Handled::error(http::ERR_BAD_REQUEST, 400),
                };

                // 再検証中にフォールバック先が追い出されないようにする
                obj.pin();
                let outcome = self
                    .coordinator
                    .fetch(key.clone(), route, Some(Arc::clone(&obj)))
                    .await;
                obj.unpin();

                match outcome {
                    FetchOutcome::Stored(fresh) => {
                        self.deliver_fetched_object(&fresh, now, include_body, keep_alive)
                    }
                    // オリジンの5xxもstale-if-error扱い。手元のコピーを優先する
                    FetchOutcome::Uncached(response) if response.status_code >= 500 => {
                        warn!(
                            "revalidation got {} from origin, serving stale-keep {}",
                            response.status_code,
                            key.canonical()
                        );
                        self.deliver_cached(&obj, CacheStatus::StaleKeep, now, include_body, keep_alive)
                    }
                    FetchOutcome::Uncached(response) => {
                        deliver_uncached(&response, include_body, keep_alive)
                    }
                    FetchOutcome::Failed(e) => {
                        // keepウィンドウ内のstaleで障害を覆い隠す
                        warn!("revalidation failed ({}), serving stale-keep {}", e, key.canonical());
                        self.deliver_cached(&obj, CacheStatus::StaleKeep, now, include_body, keep_alive)
                    }
                }
            }

            LookupAction::FetchBlocking => {
                match self.coordinator.fetch(key, route, None).await {
                    FetchOutcome::Stored(fresh) => {
                        self.deliver_fetched_object(&fresh, now, include_body, keep_alive)
                    }
                    FetchOutcome::Uncached(response) => {
                        deliver_uncached(&response, include_body, keep_alive)
                    }
                    FetchOutcome::Failed(e) => {
                        warn!("fetch failed with no fallback: {}", e);
                        Handled::new(http::maintenance_response(keep_alive), 503, "ERROR")
                    }
                }
            }
        }
    }

    /// ストアのオブジェクトを配信
    fn deliver_cached(
        &self,
        object: &CacheObject,
        status: CacheStatus,
        now: u64,
        include_body: bool,
        keep_alive: bool,
    ) -> Handled {
        let hits = object.record_hit();
        let bytes = http::build_cached_response(object, status, hits, now, include_body, keep_alive);
        Handled::new(bytes, object.status_code, status.as_str())
    }

    /// 同期フェッチで取れたばかりのオブジェクトを配信（MISS扱い）
    fn deliver_fetched_object(
        &self,
        object: &CacheObject,
        now: u64,
        include_body: bool,
        keep_alive: bool,
    ) -> Handled {
        let hits = object.record_hit();
        let bytes =
            http::build_cached_response(object, CacheStatus::Miss, hits, now, include_body, keep_alive);
        Handled::new(bytes, object.status_code, CacheStatus::Miss.as_str())
    }

    // ====================
    // 素通し経路
    // ====================

    async fn handle_pass(&self, request: &ParsedRequest, body: Vec<u8>) -> Handled {
        let include_body = !request.method.eq_ignore_ascii_case(b"HEAD");
        let keep_alive = request.keep_alive;

        let forward = self.build_forward_request(request, &body);
        match self.coordinator.passthrough(forward).await {
            Ok(response) => {
                let bytes = http::serialize_response(
                    response.status_code,
                    &response.headers,
                    &response.body,
                    &[
                        ("X-Cache", CacheStatus::Pass.as_str()),
                        ("X-Backend", &response.backend_id),
                    ],
                    include_body,
                    keep_alive,
                );
                Handled::new(bytes, response.status_code, CacheStatus::Pass.as_str())
            }
            Err(FetchError::NoHealthyBackend) => {
                Handled::new(http::maintenance_response(keep_alive), 503, "ERROR")
            }
            Err(FetchError::Timeout) => Handled::error(http::ERR_GATEWAY_TIMEOUT, 504),
            Err(e) => {
                warn!("passthrough failed: {}", e);
                Handled::error(http::ERR_BAD_GATEWAY, 502)
            }
        }
    }

    /// オリジンへ中継するリクエストバイト列を組み立てる
    ///
    /// トラッキングCookieを除去し、Content-Lengthを付け直す
    fn build_forward_request(&self, request: &ParsedRequest, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + body.len());
        let mut itoa_buf = itoa::Buffer::new();

        out.extend_from_slice(&request.method);
        out.push(b' ');
        out.extend_from_slice(request.target.as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\n");

        for (name, value) in &request.headers {
            if name.eq_ignore_ascii_case(b"connection")
                || name.eq_ignore_ascii_case(b"keep-alive")
                || name.eq_ignore_ascii_case(b"transfer-encoding")
                || name.eq_ignore_ascii_case(b"content-length")
                || name.eq_ignore_ascii_case(b"te")
                || name.eq_ignore_ascii_case(b"upgrade")
            {
                continue;
            }
            if name.eq_ignore_ascii_case(b"cookie") {
                match self.classifier.scrub_cookies(value) {
                    Some(scrubbed) => {
                        out.extend_from_slice(b"Cookie: ");
                        out.extend_from_slice(&scrubbed);
                        out.extend_from_slice(b"\r\n");
                    }
                    // 全Cookieがトラッキングならヘッダーごと落とす
                    None => {}
                }
                continue;
            }
            out.extend_from_slice(name);
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }

        if !body.is_empty() {
            out.extend_from_slice(b"Content-Length: ");
            out.extend_from_slice(itoa_buf.format(body.len()).as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"Connection: close\r\n\r\n");
        out.extend_from_slice(body);
        out
    }

    // ====================
    // 管理操作
    // ====================

    fn handle_purge(&self, request: &ParsedRequest, peer: IpAddr) -> Handled {
        if !self.is_admin_allowed(peer) {
            warn!("purge denied from {}", peer);
            return Handled::error(http::ERR_FORBIDDEN, 403);
        }

        let host = match request.host() {
            Some(h) => h,
            None => return Handled::error(http::ERR_BAD_REQUEST, 400),
        };

        // GET/HEAD両方のバリアントを消す
        let mut removed = 0usize;
        for method in [&b"GET"[..], b"HEAD"] {
            if let Some(key) = CacheKey::from_request(
                method,
                host,
                &request.target,
                self.classifier.tracking_params(),
            ) {
                if self.store.purge(&key) {
                    removed += 1;
                }
            }
        }

        info!("purge {}{} removed={}", host, request.target, removed);
        admin_response(removed)
    }

    fn handle_ban(&self, request: &ParsedRequest, peer: IpAddr) -> Handled {
        if !self.is_admin_allowed(peer) {
            warn!("ban denied from {}", peer);
            return Handled::error(http::ERR_FORBIDDEN, 403);
        }

        let pattern = match request
            .header(b"x-ban-pattern")
            .and_then(|v| std::str::from_utf8(v).ok())
        {
            Some(p) => p,
            None => return Handled::error(http::ERR_BAD_REQUEST, 400),
        };

        match self.bans.ban(pattern, &self.store) {
            Ok(removed) => {
                info!("ban '{}' removed={}", pattern, removed);
                admin_response(removed)
            }
            Err(_) => Handled::error(http::ERR_BAD_REQUEST, 400),
        }
    }
}

/// 格納対象外レスポンスをMISSとして配信
fn deliver_uncached(response: &FetchedResponse, include_body: bool, keep_alive: bool) -> Handled {
    let bytes = http::serialize_response(
        response.status_code,
        &response.headers,
        &response.body,
        &[
            ("X-Cache", CacheStatus::Miss.as_str()),
            ("X-Backend", &response.backend_id),
        ],
        include_body,
        keep_alive,
    );
    Handled::new(bytes, response.status_code, CacheStatus::Miss.as_str())
}

/// 管理操作の200レスポンス（冪等: 0件でも200）
fn admin_response(removed: usize) -> Handled {
    let body = format!("removed {}\n", removed);
    let bytes = http::serialize_response(
        200,
        &[(
            b"content-type".to_vec().into(),
            b"text/plain; charset=utf-8".to_vec().into(),
        )],
        body.as_bytes(),
        &[],
        true,
        true,
    );
    Handled::new(bytes, 200, "ADMIN")
}
