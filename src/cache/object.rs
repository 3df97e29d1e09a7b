//! キャッシュオブジェクト
//!
//! ストアに格納されるレスポンス1件分。ボディとヘッダーは`Arc`で共有し、
//! 配信パスではコピーせずに参照だけ渡します。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// 現在のUNIX時刻（秒）
///
/// 鮮度計算はすべてこの時刻基準。テストでは`created_unix`を過去に
/// ずらすことで経過時間を再現する
#[inline]
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// キャッシュオブジェクト
///
/// キャッシュされたレスポンスのメタデータとボディを保持します。
/// ttl/grace/keepは格納時にポリシーで確定し、以後不変です。
#[derive(Debug)]
pub struct CacheObject {
    /// レスポンスステータスコード
    pub status_code: u16,
    /// レスポンスヘッダー（名前-値ペアのリスト）
    pub headers: Arc<[(Box<[u8]>, Box<[u8]>)]>,
    /// レスポンスボディ
    pub body: Arc<[u8]>,
    /// 格納時刻（UNIX秒）
    pub created_unix: u64,
    /// fresh期間（秒）
    pub ttl_secs: u64,
    /// grace期間（秒）: TTL切れ後、stale配信+バックグラウンド再検証
    pub grace_secs: u64,
    /// keep期間（秒）: grace切れ後、オリジン障害時のみstale配信
    pub keep_secs: u64,
    /// ETag（条件付き再検証用）
    pub etag: Option<Box<str>>,
    /// Last-Modified（条件付き再検証用）
    pub last_modified: Option<Box<str>>,
    /// このオブジェクトを取得したバックエンドの識別子
    pub backend_id: Box<str>,
    /// 配信回数（X-Cache-Hitsヘッダー用）
    hit_count: AtomicU64,
    /// エビクション対象外フラグ
    pinned: AtomicBool,
}

impl CacheObject {
    /// 新しいオブジェクトを作成
    pub fn new(
        status_code: u16,
        headers: Vec<(Box<[u8]>, Box<[u8]>)>,
        body: Vec<u8>,
        ttl_secs: u64,
        grace_secs: u64,
        keep_secs: u64,
        backend_id: &str,
    ) -> Self {
        // 再検証に使うバリデータをヘッダーから抽出
        let mut etag = None;
        let mut last_modified = None;
        for (name, value) in &headers {
            if name.eq_ignore_ascii_case(b"etag") {
                if let Ok(s) = std::str::from_utf8(value) {
                    etag = Some(s.into());
                }
            } else if name.eq_ignore_ascii_case(b"last-modified") {
                if let Ok(s) = std::str::from_utf8(value) {
                    last_modified = Some(s.into());
                }
            }
        }

        Self {
            status_code,
            headers: headers.into(),
            body: body.into(),
            created_unix: now_unix(),
            ttl_secs,
            grace_secs,
            keep_secs,
            etag,
            last_modified,
            backend_id: backend_id.into(),
            hit_count: AtomicU64::new(0),
            pinned: AtomicBool::new(false),
        }
    }

    /// 経過時間（秒）
    #[inline]
    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_unix)
    }

    /// 配信回数をインクリメントし、更新後の値を返す
    #[inline]
    pub fn record_hit(&self) -> u64 {
        self.hit_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// 現在の配信回数
    #[inline]
    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    /// エビクション対象外としてマーク
    #[inline]
    pub fn pin(&self) {
        self.pinned.store(true, Ordering::Relaxed);
    }

    /// エビクション対象に戻す
    #[inline]
    pub fn unpin(&self) {
        self.pinned.store(false, Ordering::Relaxed);
    }

    /// エビクション対象外かどうか
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Relaxed)
    }

    /// 概算メモリ使用量を計算
    pub fn memory_usage(&self) -> usize {
        let mut size = std::mem::size_of::<Self>();
        for (name, value) in self.headers.iter() {
            size += name.len() + value.len();
        }
        size += self.body.len();
        if let Some(s) = &self.etag {
            size += s.len();
        }
        if let Some(s) = &self.last_modified {
            size += s.len();
        }
        size
    }

    /// 格納時刻を過去にずらす（テスト用）
    #[cfg(test)]
    pub fn backdate(mut self, secs: u64) -> Self {
        self.created_unix = self.created_unix.saturating_sub(secs);
        self
    }
}
