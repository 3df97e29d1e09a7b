//! # gracegate
//!
//! エッジTLS終端とHTTPオリジンの間に置く、stale許容型キャッシュゲートウェイ。
//!
//! ## 特徴
//!
//! - **TTL/Grace/Keep**: 鮮度ウィンドウの三段階ステートマシン
//!   - TTL内: オリジンに接続せずに配信
//!   - Grace内: staleを即配信しつつバックグラウンドで再検証
//!   - Keep内: オリジン障害時のみstaleを配信（stale-if-error）
//! - **Request Collapsing**: 同一キーへの同時フェッチを1本に合流
//! - **ヘルスゲーティング**: 専用モニタがバックエンドのhealthy/sickを管理し、
//!   sick時はネットワークを叩かずに即フォールバック
//! - **無効化**: PURGE（完全一致）とBAN（globパターン）、送信元ACL付き
//! - **インメモリストア**: DashMapによるロックフリー並行アクセス、
//!   メモリ上限とLRU風エビクション（pinned除外）
//!
//! ## アーキテクチャ
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  Gateway (proxy.rs)                          │
//! │  ├─ Classifier      (classify.rs)            │← cacheable / pass判定
//! │  ├─ CacheKey        (cache/key.rs)           │← 正規化キー
//! │  ├─ ObjectStore     (cache/store.rs)         │← DashMap + メモリ上限
//! │  ├─ Freshness/決定  (cache/state.rs)         │← 純粋関数
//! │  ├─ FetchCoordinator(fetch.rs)               │← 合流フェッチ
//! │  ├─ Policy          (cache/policy.rs)        │← ttl/grace/keep導出
//! │  ├─ BanList         (cache/ban.rs)           │← purge/ban
//! │  └─ BackendRegistry (backend.rs, health.rs)  │← ヘルススナップショット
//! └──────────────────────────────────────────────┘
//! ```
//!
//! TLS終端・バーチャルホスト振り分け・永続化はスコープ外。

pub mod backend;
pub mod cache;
pub mod classify;
pub mod config;
pub mod fetch;
pub mod health;
pub mod http;
pub mod proxy;
