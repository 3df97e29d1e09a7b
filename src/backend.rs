//! バックエンドレジストリ
//!
//! 設定から与えられるオリジンサーバー群と、その健康状態の共有ビューを
//! 管理します。healthyフラグの書き込みはヘルスモニタだけが行い、
//! リクエストパスは読むだけです。

use crate::config::BackendSection;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// バックエンド1台分
#[derive(Debug)]
pub struct BackendTarget {
    /// 識別子（X-Backendヘッダーとログに載る）
    pub id: Box<str>,
    /// ホスト名またはIP
    pub host: Box<str>,
    /// ポート
    pub port: u16,
    /// 健康状態。書き込みはヘルスモニタのみ
    healthy: AtomicBool,
}

impl BackendTarget {
    fn new(section: &BackendSection) -> Self {
        Self {
            id: section.id.as_str().into(),
            host: section.host.as_str().into(),
            port: section.port,
            // 起動直後は楽観的にhealthy。最初のプローブで確定する
            healthy: AtomicBool::new(true),
        }
    }

    /// 接続先アドレス（host:port）
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[inline]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }
}

/// バックエンドレジストリ
///
/// healthyなターゲットをラウンドロビンで選択します。
pub struct BackendRegistry {
    targets: Vec<Arc<BackendTarget>>,
    /// ラウンドロビンのカーソル
    cursor: AtomicUsize,
}

impl BackendRegistry {
    /// 設定から構築
    pub fn from_config(sections: &[BackendSection]) -> Self {
        Self {
            targets: sections.iter().map(|s| Arc::new(BackendTarget::new(s))).collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// 全ターゲット
    #[inline]
    pub fn targets(&self) -> &[Arc<BackendTarget>] {
        &self.targets
    }

    /// healthyなターゲットが1台でもいるか
    pub fn any_healthy(&self) -> bool {
        self.targets.iter().any(|t| t.is_healthy())
    }

    /// healthyなターゲットをラウンドロビンで選択
    ///
    /// 全滅している場合はNone
    pub fn pick_healthy(&self) -> Option<Arc<BackendTarget>> {
        let n = self.targets.len();
        if n == 0 {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for i in 0..n {
            let target = &self.targets[(start + i) % n];
            if target.is_healthy() {
                return Some(Arc::clone(target));
            }
        }
        None
    }
}
