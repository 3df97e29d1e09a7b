//! BAN（パターン無効化）
//!
//! globパターンによるキャッシュ無効化を提供します。BAN受付時に既存
//! エントリを即時スイープし、同時にルールを記録して、スイープ時点で
//! 書き込み途中だったオブジェクトをルックアップ時に遅延判定で捕捉します。

use super::object::now_unix;
use super::store::ObjectStore;
use std::sync::RwLock;

/// BANルール
///
/// ルール作成時点より古いオブジェクトだけに適用される
#[derive(Debug)]
struct BanRule {
    pattern: glob::Pattern,
    created_unix: u64,
}

/// BANリスト
pub struct BanList {
    rules: RwLock<Vec<BanRule>>,
    /// ルールを保持する地平線（秒）。ttl+grace+keepの最大値より古い
    /// ルールは、対象になりうるオブジェクトが残っていないので破棄できる
    horizon_secs: u64,
}

impl BanList {
    pub fn new(horizon_secs: u64) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            horizon_secs,
        }
    }

    /// BANを受け付ける
    ///
    /// ストアを即時スイープし、遅延判定用にルールを記録する
    ///
    /// # Returns
    ///
    /// 即時スイープで削除されたエントリ数
    pub fn ban(&self, pattern_str: &str, store: &ObjectStore) -> Result<usize, glob::PatternError> {
        let pattern = glob::Pattern::new(pattern_str)?;
        let now = now_unix();

        let removed = store.sweep_pattern(&pattern);

        if let Ok(mut rules) = self.rules.write() {
            rules.push(BanRule { pattern, created_unix: now });
            // ついでに期限切れルールを落とす
            rules.retain(|r| now.saturating_sub(r.created_unix) <= self.horizon_secs);
        }

        Ok(removed)
    }

    /// オブジェクトがBAN済みか判定（ルックアップ時の遅延チェック)
    ///
    /// ルール作成時点以前に作られたオブジェクトだけが対象
    pub fn is_banned(&self, canonical: &str, object_created_unix: u64) -> bool {
        match self.rules.read() {
            Ok(rules) => rules.iter().any(|r| {
                object_created_unix <= r.created_unix && r.pattern.matches(canonical)
            }),
            Err(_) => false,
        }
    }

    /// 地平線を超えたルールを破棄する
    ///
    /// 対象になりうるオブジェクトが全て期限切れになったルールは不要。
    /// BANが来なくても定期ハウスキーピングから呼ばれる
    pub fn compact(&self, now: u64) {
        if let Ok(mut rules) = self.rules.write() {
            rules.retain(|r| now.saturating_sub(r.created_unix) <= self.horizon_secs);
        }
    }

    /// 現在のルール数
    pub fn len(&self) -> usize {
        self.rules.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
