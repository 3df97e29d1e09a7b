//! 鮮度ステートマシン
//!
//! TTL/Grace/Keepの三段階ウィンドウに対する純粋な判定関数。
//! 時刻もI/Oもここには持ち込まず、経過秒数とバックエンドの健康状態だけを
//! 入力として配信アクションを決めます。
//!
//! ```text
//! age:  0 ──────── ttl ──────── ttl+grace ──────── ttl+grace+keep ───→
//!       │  Fresh   │ StaleGrace │     StaleKeep    │    Expired
//! ```

use super::object::CacheObject;

/// 鮮度の区分
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// TTL内。オリジンに接続せず配信
    Fresh,
    /// grace内。stale配信+バックグラウンド再検証
    StaleGrace,
    /// keep内。オリジン障害時のみstale配信に使える
    StaleKeep,
    /// 全ウィンドウ超過。存在しないのと同じ
    Expired,
}

impl Freshness {
    /// 経過秒数から鮮度を判定
    pub fn classify(age: u64, ttl: u64, grace: u64, keep: u64) -> Self {
        if age < ttl {
            Freshness::Fresh
        } else if age < ttl.saturating_add(grace) {
            Freshness::StaleGrace
        } else if age < ttl.saturating_add(grace).saturating_add(keep) {
            Freshness::StaleKeep
        } else {
            Freshness::Expired
        }
    }

    /// オブジェクトの現在の鮮度
    pub fn of(object: &CacheObject, now: u64) -> Self {
        Self::classify(
            object.age_secs(now),
            object.ttl_secs,
            object.grace_secs,
            object.keep_secs,
        )
    }
}

/// X-Cacheヘッダーに載せる配信結果ラベル
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    StaleGrace,
    StaleKeep,
    Pass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::StaleGrace => "STALE_GRACE",
            CacheStatus::StaleKeep => "STALE_KEEP",
            CacheStatus::Pass => "PASS",
        }
    }
}

/// ルックアップ結果に対する配信アクション
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupAction {
    /// 手元のオブジェクトをそのまま配信
    Deliver(CacheStatus),
    /// stale配信しつつバックグラウンドで再検証をキック
    DeliverAndRevalidate,
    /// 同期フェッチ。失敗したら手元のstale（keep内）へフォールバック
    RevalidateBlocking,
    /// 同期フェッチ。フォールバック先なし
    FetchBlocking,
}

/// 鮮度と健康状態から配信アクションを決定
///
/// バックエンドがsickの間はネットワークに一切触れない判定を返す。
/// `freshness`がNoneはキャッシュ不在（ミス）を表す
pub fn decide(freshness: Option<Freshness>, backend_healthy: bool) -> LookupAction {
    match (freshness, backend_healthy) {
        // freshはオリジンの状態に関係なく即配信
        (Some(Freshness::Fresh), _) => LookupAction::Deliver(CacheStatus::Hit),

        (Some(Freshness::StaleGrace), true) => LookupAction::DeliverAndRevalidate,
        (Some(Freshness::StaleGrace), false) => LookupAction::Deliver(CacheStatus::StaleGrace),

        (Some(Freshness::StaleKeep), true) => LookupAction::RevalidateBlocking,
        (Some(Freshness::StaleKeep), false) => LookupAction::Deliver(CacheStatus::StaleKeep),

        // Expiredと不在は同じ扱い。sickでもフェッチを試み、
        // コーディネータ側がネットワークに出ずに即エラーを返す
        (Some(Freshness::Expired), _) | (None, _) => LookupAction::FetchBlocking,
    }
}
