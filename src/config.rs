//! 設定
//!
//! `config.toml` から読み込むゲートウェイ全体の設定を定義します。
//! 各フィールドは `#[serde(default = "...")]` でデフォルト値を持ち、
//! 設定ファイルには変更したい項目だけを書けば動作します。

use serde::Deserialize;
use std::io;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

fn default_listen() -> String { "0.0.0.0:8080".to_string() }
fn default_ttl() -> u64 { 300 }            // 5分
fn default_grace() -> u64 { 86_400 }       // 24時間
fn default_keep() -> u64 { 604_800 }       // 7日
fn default_min_fresh() -> u64 { 10 }
fn default_memory_budget() -> usize { 256 * 1024 * 1024 } // 256MB
fn default_static_ttl() -> u64 { 86_400 }
fn default_static_grace() -> u64 { 604_800 }
fn default_redirect_ttl() -> u64 { 60 }
fn default_redirect_grace() -> u64 { 600 }

fn default_static_extensions() -> Vec<String> {
    [
        "css", "js", "png", "jpg", "jpeg", "gif", "svg", "ico",
        "woff", "woff2", "ttf", "webp", "avif", "mp4", "pdf",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_connect_timeout() -> u64 { 5 }
fn default_first_byte_timeout() -> u64 { 30 }
fn default_idle_timeout() -> u64 { 30 }

fn default_probe_interval() -> u64 { 5 }
fn default_probe_timeout() -> u64 { 2 }
fn default_failure_threshold() -> u32 { 3 }
fn default_success_threshold() -> u32 { 2 }
fn default_probe_path() -> String { "/".to_string() }

fn default_admin_allowlist() -> Vec<String> {
    vec!["127.0.0.1".to_string(), "::1".to_string()]
}

fn default_bypass_paths() -> Vec<String> {
    vec![
        "/wp-admin/*".to_string(),
        "/wp-login.php".to_string(),
        "/wp-cron.php".to_string(),
        "/xmlrpc.php".to_string(),
    ]
}

fn default_session_cookies() -> Vec<String> {
    vec![
        "wordpress_logged_in*".to_string(),
        "wordpress_sec*".to_string(),
        "wp-postpass*".to_string(),
        "PHPSESSID*".to_string(),
        "comment_author*".to_string(),
    ]
}

fn default_tracking_cookies() -> Vec<String> {
    vec![
        "_ga*".to_string(),
        "_gid".to_string(),
        "__utm*".to_string(),
        "has_js".to_string(),
    ]
}

fn default_tracking_params() -> Vec<String> {
    vec![
        "utm_*".to_string(),
        "gclid".to_string(),
        "fbclid".to_string(),
        "msclkid".to_string(),
        "mc_cid".to_string(),
        "mc_eid".to_string(),
    ]
}

/// サーバー設定
#[derive(Deserialize, Clone, Debug)]
pub struct ServerSection {
    /// リッスンアドレス
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { listen: default_listen() }
    }
}

/// キャッシュ設定
///
/// ttl/grace/keepはオリジンがCache-Controlを返さない場合のデフォルト。
#[derive(Deserialize, Clone, Debug)]
pub struct CacheSection {
    /// デフォルトTTL（秒）
    #[serde(default = "default_ttl")]
    pub default_ttl_secs: u64,

    /// デフォルトgrace（秒）
    ///
    /// TTL切れ後、staleを配信しながらバックグラウンド再検証する猶予
    #[serde(default = "default_grace")]
    pub default_grace_secs: u64,

    /// デフォルトkeep（秒）
    ///
    /// grace切れ後、オリジン障害時のみstaleを配信できる保持期間
    #[serde(default = "default_keep")]
    pub default_keep_secs: u64,

    /// 最小鮮度ウィンドウ（秒）
    ///
    /// オリジンがmax-age=0を返してもCookieなしのキャッシュ可能レスポンスは
    /// この秒数だけfreshとして扱う（スタンピード防止）
    #[serde(default = "default_min_fresh")]
    pub min_fresh_secs: u64,

    /// メモリ上限（バイト）
    #[serde(default = "default_memory_budget")]
    pub memory_budget_bytes: usize,

    /// 静的アセット用TTL（秒）
    #[serde(default = "default_static_ttl")]
    pub static_ttl_secs: u64,

    /// 静的アセット用grace（秒）
    #[serde(default = "default_static_grace")]
    pub static_grace_secs: u64,

    /// リダイレクト（3xx）用TTL（秒）
    #[serde(default = "default_redirect_ttl")]
    pub redirect_ttl_secs: u64,

    /// リダイレクト（3xx）用grace（秒）
    #[serde(default = "default_redirect_grace")]
    pub redirect_grace_secs: u64,

    /// 静的アセットとして扱う拡張子
    #[serde(default = "default_static_extensions")]
    pub static_asset_extensions: Vec<String>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl(),
            default_grace_secs: default_grace(),
            default_keep_secs: default_keep(),
            min_fresh_secs: default_min_fresh(),
            memory_budget_bytes: default_memory_budget(),
            static_ttl_secs: default_static_ttl(),
            static_grace_secs: default_static_grace(),
            redirect_ttl_secs: default_redirect_ttl(),
            redirect_grace_secs: default_redirect_grace(),
            static_asset_extensions: default_static_extensions(),
        }
    }
}

impl CacheSection {
    /// オブジェクトが理論上生存しうる最大秒数（banリスト圧縮の地平線）
    #[inline]
    pub fn max_lifetime_secs(&self) -> u64 {
        let base = self.default_ttl_secs + self.default_grace_secs + self.default_keep_secs;
        let stat = self.static_ttl_secs + self.static_grace_secs + self.default_keep_secs;
        base.max(stat)
    }
}

/// オリジンフェッチのタイムアウト設定
#[derive(Deserialize, Clone, Debug)]
pub struct TimeoutSection {
    /// 接続タイムアウト（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_secs: u64,

    /// 先頭バイトタイムアウト（秒）
    #[serde(default = "default_first_byte_timeout")]
    pub first_byte_secs: u64,

    /// アイドルタイムアウト（秒）
    ///
    /// ボディ受信中、読み込みの間隔がこれを超えたら打ち切り
    #[serde(default = "default_idle_timeout")]
    pub idle_secs: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_timeout(),
            first_byte_secs: default_first_byte_timeout(),
            idle_secs: default_idle_timeout(),
        }
    }
}

impl TimeoutSection {
    #[inline]
    pub fn connect(&self) -> Duration { Duration::from_secs(self.connect_secs) }
    #[inline]
    pub fn first_byte(&self) -> Duration { Duration::from_secs(self.first_byte_secs) }
    #[inline]
    pub fn idle(&self) -> Duration { Duration::from_secs(self.idle_secs) }
}

/// ヘルスプローブ設定
#[derive(Deserialize, Clone, Debug)]
pub struct ProbeSection {
    /// プローブ間隔（秒）
    #[serde(default = "default_probe_interval")]
    pub interval_secs: u64,

    /// プローブタイムアウト（秒）
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,

    /// healthy→sick遷移に必要な連続失敗回数
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// sick→healthy遷移に必要な連続成功回数
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// プローブで叩くパス
    #[serde(default = "default_probe_path")]
    pub path: String,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            interval_secs: default_probe_interval(),
            timeout_secs: default_probe_timeout(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            path: default_probe_path(),
        }
    }
}

impl ProbeSection {
    #[inline]
    pub fn interval(&self) -> Duration { Duration::from_secs(self.interval_secs) }
    #[inline]
    pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout_secs) }
}

/// 管理操作（PURGE/BAN）の設定
#[derive(Deserialize, Clone, Debug)]
pub struct AdminSection {
    /// PURGE/BANを許可する送信元IPアドレス
    #[serde(default = "default_admin_allowlist")]
    pub allowlist: Vec<String>,
}

impl Default for AdminSection {
    fn default() -> Self {
        Self { allowlist: default_admin_allowlist() }
    }
}

impl AdminSection {
    /// 許可リストをパース（不正な文字列は起動時エラー）
    pub fn parsed_allowlist(&self) -> io::Result<Vec<IpAddr>> {
        self.allowlist
            .iter()
            .map(|s| {
                s.parse::<IpAddr>().map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("invalid admin allowlist entry '{}': {}", s, e),
                    )
                })
            })
            .collect()
    }
}

/// リクエスト分類の設定（globパターン）
#[derive(Deserialize, Clone, Debug)]
pub struct ClassifierSection {
    /// 常にパススルーするパス
    #[serde(default = "default_bypass_paths")]
    pub bypass_paths: Vec<String>,

    /// セッション/認証Cookie名パターン（存在したらパススルー）
    #[serde(default = "default_session_cookies")]
    pub session_cookies: Vec<String>,

    /// 転送前に取り除くトラッキングCookie名パターン
    #[serde(default = "default_tracking_cookies")]
    pub tracking_cookies: Vec<String>,

    /// キャッシュキーから除外するクエリパラメータ名パターン
    #[serde(default = "default_tracking_params")]
    pub tracking_params: Vec<String>,
}

impl Default for ClassifierSection {
    fn default() -> Self {
        Self {
            bypass_paths: default_bypass_paths(),
            session_cookies: default_session_cookies(),
            tracking_cookies: default_tracking_cookies(),
            tracking_params: default_tracking_params(),
        }
    }
}

/// バックエンド定義
///
/// デプロイツール側から静的に供給されるディレクトリ。追加削除は
/// 再起動/リロードで反映する。
#[derive(Deserialize, Clone, Debug)]
pub struct BackendSection {
    /// 識別子（X-Backendヘッダーに載る）
    pub id: String,
    /// ホスト名またはIP
    pub host: String,
    /// ポート
    pub port: u16,
}

/// ゲートウェイ設定全体
#[derive(Deserialize, Clone, Debug, Default)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub probe: ProbeSection,
    #[serde(default)]
    pub admin: AdminSection,
    #[serde(default)]
    pub classifier: ClassifierSection,
    #[serde(default)]
    pub backend: Vec<BackendSection>,
}

impl ProxyConfig {
    /// 設定ファイルを読み込む
    pub fn load(path: &Path) -> io::Result<Self> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ProxyConfig = toml::from_str(&config_str).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("TOML parse error: {}", e))
        })?;
        if config.backend.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "at least one [[backend]] is required",
            ));
        }
        Ok(config)
    }
}
