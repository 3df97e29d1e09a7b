//! オブジェクトストア
//!
//! DashMapを使用したロックフリーなインメモリストアを提供します。
//! メモリ使用量を予算内に保ち、超過時は最終アクセスが古いものから
//! 追い出します（pinnedなオブジェクトは対象外）。

use super::key::CacheKey;
use super::object::CacheObject;
use super::state::Freshness;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// オブジェクトストア
///
/// キャッシュキーのハッシュからオブジェクトへのマッピングを管理します。
pub struct ObjectStore {
    /// 格納エントリのマップ（ハッシュ値 → エントリ）
    entries: DashMap<u64, StoredEntry>,
    /// 現在のエントリ数
    entry_count: AtomicUsize,
    /// 現在の合計メモリ使用量（概算）
    memory_usage: AtomicUsize,
    /// メモリ予算（バイト）
    memory_budget: usize,
    /// キャッシュヒット数
    hits: AtomicU64,
    /// キャッシュミス数
    misses: AtomicU64,
    /// 最終アクセス時刻の基準点
    epoch: Instant,
}

/// 格納エントリ
struct StoredEntry {
    /// キャッシュキー（衝突検出とBANパターン照合用）
    key: CacheKey,
    /// オブジェクト本体
    object: Arc<CacheObject>,
    /// 最終アクセス時刻（epochからのミリ秒）
    last_accessed_ms: AtomicU64,
}

impl ObjectStore {
    /// 新しいストアを作成
    pub fn new(memory_budget: usize) -> Self {
        Self {
            entries: DashMap::new(),
            entry_count: AtomicUsize::new(0),
            memory_usage: AtomicUsize::new(0),
            memory_budget,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    #[inline]
    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// オブジェクトを取得
    ///
    /// 鮮度の判定は呼び出し側が行う。ここではキーの完全一致だけを確認し、
    /// アクセス統計を更新して返す
    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<CacheObject>> {
        let hash = key.hash_value();

        let entry = match self.entries.get(&hash) {
            Some(e) => e,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        // ハッシュ衝突対策
        if entry.key != *key {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        entry.last_accessed_ms.store(self.elapsed_ms(), Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);

        Some(Arc::clone(&entry.object))
    }

    /// オブジェクトを挿入または更新
    ///
    /// 予算超過時はエビクションを走らせてから戻る
    pub fn insert(&self, key: CacheKey, object: Arc<CacheObject>) {
        let hash = key.hash_value();
        let memory = object.memory_usage();

        let entry = StoredEntry {
            key,
            object,
            last_accessed_ms: AtomicU64::new(self.elapsed_ms()),
        };

        // 既存エントリがある場合はメモリ使用量を調整
        if let Some(old) = self.entries.insert(hash, entry) {
            let old_memory = old.object.memory_usage();
            if memory > old_memory {
                self.memory_usage.fetch_add(memory - old_memory, Ordering::Relaxed);
            } else {
                self.memory_usage.fetch_sub(old_memory - memory, Ordering::Relaxed);
            }
        } else {
            self.entry_count.fetch_add(1, Ordering::Relaxed);
            self.memory_usage.fetch_add(memory, Ordering::Relaxed);
        }

        if self.memory_usage() > self.memory_budget {
            self.evict_to_budget();
        }
    }

    /// 完全一致でオブジェクトを削除（PURGE）
    pub fn purge(&self, key: &CacheKey) -> bool {
        let hash = key.hash_value();

        if let Some(entry) = self.entries.get(&hash) {
            if entry.key != *key {
                return false;
            }
        } else {
            return false;
        }

        if let Some((_, removed)) = self.entries.remove(&hash) {
            self.entry_count.fetch_sub(1, Ordering::Relaxed);
            self.memory_usage
                .fetch_sub(removed.object.memory_usage(), Ordering::Relaxed);
            return true;
        }
        false
    }

    /// globパターンに一致するエントリを削除（BANの即時スイープ）
    ///
    /// パターンは正準形 `host/path?query` に対して照合される
    ///
    /// # Returns
    ///
    /// 削除されたエントリ数
    pub fn sweep_pattern(&self, pattern: &glob::Pattern) -> usize {
        let mut hashes_to_remove = Vec::new();

        for entry in self.entries.iter() {
            if pattern.matches(&entry.value().key.canonical()) {
                hashes_to_remove.push(*entry.key());
            }
        }

        let mut removed = 0;
        for hash in hashes_to_remove {
            if let Some((_, entry)) = self.entries.remove(&hash) {
                self.entry_count.fetch_sub(1, Ordering::Relaxed);
                self.memory_usage
                    .fetch_sub(entry.object.memory_usage(), Ordering::Relaxed);
                removed += 1;
            }
        }

        removed
    }

    /// 全ウィンドウを超過したエントリを削除
    ///
    /// 定期的なクリーンアップに使用
    pub fn sweep_expired(&self, now: u64) -> usize {
        let mut evicted = 0;

        self.entries.retain(|_, entry| {
            if Freshness::of(&entry.object, now) == Freshness::Expired {
                evicted += 1;
                self.entry_count.fetch_sub(1, Ordering::Relaxed);
                self.memory_usage
                    .fetch_sub(entry.object.memory_usage(), Ordering::Relaxed);
                false
            } else {
                true
            }
        });

        evicted
    }

    /// メモリ予算まで追い出す
    ///
    /// 最終アクセスが古い順に、予算+10%分の空きができるまで削除する。
    /// pinnedなオブジェクトは飛ばす
    pub fn evict_to_budget(&self) -> usize {
        let current_memory = self.memory_usage();

        if current_memory <= self.memory_budget {
            return 0;
        }

        let mut candidates: Vec<(u64, u64, usize)> = self
            .entries
            .iter()
            .filter(|entry| !entry.value().object.is_pinned())
            .map(|entry| {
                (
                    *entry.key(),
                    entry.value().last_accessed_ms.load(Ordering::Relaxed),
                    entry.value().object.memory_usage(),
                )
            })
            .collect();

        // 最終アクセスが古い順にソート
        candidates.sort_by_key(|(_, accessed, _)| *accessed);

        let mut evicted = 0;
        let mut freed_memory = 0;
        let target_free = current_memory.saturating_sub(self.memory_budget)
            + (self.memory_budget / 10); // 10%余分に解放

        for (hash, _, memory) in candidates {
            if freed_memory >= target_free {
                break;
            }

            if self.entries.remove(&hash).is_some() {
                self.entry_count.fetch_sub(1, Ordering::Relaxed);
                self.memory_usage.fetch_sub(memory, Ordering::Relaxed);
                freed_memory += memory;
                evicted += 1;
            }
        }

        evicted
    }

    /// 現在のエントリ数
    #[inline]
    pub fn len(&self) -> usize {
        self.entry_count.load(Ordering::Relaxed)
    }

    /// ストアが空かどうか
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 現在のメモリ使用量（概算）
    #[inline]
    pub fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }

    /// キャッシュヒット数
    #[inline]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// キャッシュミス数
    #[inline]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// ヒット率（パーセンテージ）
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total > 0.0 {
            (hits / total) * 100.0
        } else {
            0.0
        }
    }
}
