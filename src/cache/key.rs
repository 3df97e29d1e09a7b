//! キャッシュキー
//!
//! リクエストから決定論的なキーを導出します。同一リソースへの表記ゆれ
//! （`www.`プレフィックス、ポート番号、クエリ順序、トラッキングパラメータ）は
//! 正規化で吸収し、同じ論理リソースは常に同じキーへ写像します。

use std::hash::{Hash, Hasher};
use xxhash_rust::xxh3::xxh3_64;

/// キャッシュ可能なHTTPメソッド
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheableMethod {
    Get,
    Head,
}

impl CacheableMethod {
    /// バイト列からパース
    pub fn from_bytes(method: &[u8]) -> Option<Self> {
        if method.eq_ignore_ascii_case(b"GET") {
            Some(CacheableMethod::Get)
        } else if method.eq_ignore_ascii_case(b"HEAD") {
            Some(CacheableMethod::Head)
        } else {
            None
        }
    }

    /// 文字列として取得
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheableMethod::Get => "GET",
            CacheableMethod::Head => "HEAD",
        }
    }
}

/// キャッシュキー
///
/// 正規化済みの(メソッド, ホスト, パス, クエリ)と事前計算ハッシュを保持する。
/// 構築後は不変。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheKey {
    method: CacheableMethod,
    /// 正規化済みホスト（小文字、`www.`とポートを除去）
    host: Box<str>,
    /// パス（クエリを含まない）
    path: Box<str>,
    /// 正規化済みクエリ（トラッキング除外・名前順ソート済み）。空ならNone
    query: Option<Box<str>>,
    /// 事前計算されたハッシュ値
    hash: u64,
}

impl CacheKey {
    /// 正規化済みの部品からキーを作成
    pub fn new(
        method: CacheableMethod,
        host: &str,
        path: &str,
        query: Option<&str>,
    ) -> Self {
        let hash = Self::compute_hash(method, host, path, query);
        Self {
            method,
            host: host.into(),
            path: path.into(),
            query: query.map(Into::into),
            hash,
        }
    }

    /// リクエスト情報からキーを導出
    ///
    /// # Arguments
    ///
    /// * `method` - HTTPメソッド（GET/HEAD以外はNone）
    /// * `host` - Hostヘッダー値（`www.`プレフィックスとポートは除去される）
    /// * `path_and_query` - リクエストターゲット（`/a/b?x=1` 形式）
    /// * `tracking_params` - キーから除外するパラメータ名パターン
    pub fn from_request(
        method: &[u8],
        host: &str,
        path_and_query: &str,
        tracking_params: &[glob::Pattern],
    ) -> Option<Self> {
        let method = CacheableMethod::from_bytes(method)?;
        let host = Self::normalize_host(host);

        let (path, raw_query) = match path_and_query.find('?') {
            Some(idx) => (&path_and_query[..idx], Some(&path_and_query[idx + 1..])),
            None => (path_and_query, None),
        };

        let query = raw_query.and_then(|q| Self::normalize_query(q, tracking_params));

        Some(Self::new(method, &host, path, query.as_deref()))
    }

    /// ホスト名を正規化
    ///
    /// 小文字化し、先頭の`www.`とポート部分を取り除く
    fn normalize_host(host: &str) -> String {
        let host = host.trim().to_ascii_lowercase();
        // IPv6リテラル（[::1]:8080）はポート除去の分岐が別
        let without_port = if let Some(rest) = host.strip_prefix('[') {
            match rest.find(']') {
                Some(end) => format!("[{}]", &rest[..end]),
                None => host.clone(),
            }
        } else {
            match host.rfind(':') {
                Some(idx) if host[idx + 1..].bytes().all(|b| b.is_ascii_digit()) => {
                    host[..idx].to_string()
                }
                _ => host.clone(),
            }
        };
        without_port
            .strip_prefix("www.")
            .map(|s| s.to_string())
            .unwrap_or(without_port)
    }

    /// クエリ文字列を正規化
    ///
    /// トラッキングパラメータを除外し、残りを名前順でソートして結合する。
    /// 全パラメータが除外されたらNone
    fn normalize_query(query: &str, tracking_params: &[glob::Pattern]) -> Option<String> {
        let mut params: Vec<&str> = query
            .split('&')
            .filter(|p| !p.is_empty())
            .filter(|p| {
                let name = p.split('=').next().unwrap_or(p);
                !tracking_params.iter().any(|pat| pat.matches(name))
            })
            .collect();

        if params.is_empty() {
            return None;
        }

        params.sort_unstable();
        Some(params.join("&"))
    }

    /// ハッシュ値を計算
    fn compute_hash(
        method: CacheableMethod,
        host: &str,
        path: &str,
        query: Option<&str>,
    ) -> u64 {
        let mut data = Vec::with_capacity(host.len() + path.len() + 32);

        data.extend_from_slice(method.as_str().as_bytes());
        data.push(b'\x00');
        data.extend_from_slice(host.as_bytes());
        data.push(b'\x00');
        data.extend_from_slice(path.as_bytes());

        if let Some(q) = query {
            data.push(b'\x00');
            data.extend_from_slice(q.as_bytes());
        }

        xxh3_64(&data)
    }

    /// メソッドを取得
    #[inline]
    pub fn method(&self) -> CacheableMethod {
        self.method
    }

    /// ホスト名を取得
    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// パスを取得
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// 正規化済みクエリを取得
    #[inline]
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// ハッシュ値を取得
    #[inline]
    pub fn hash_value(&self) -> u64 {
        self.hash
    }

    /// オリジンへ送るリクエストターゲット（`/path?query`）
    pub fn request_target(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.to_string(),
        }
    }

    /// BANパターン照合用の正準形（`host/path?query`）
    pub fn canonical(&self) -> String {
        match &self.query {
            Some(q) => format!("{}{}?{}", self.host, self.path, q),
            None => format!("{}{}", self.host, self.path),
        }
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // 事前計算されたハッシュ値を使用
        state.write_u64(self.hash);
    }
}
