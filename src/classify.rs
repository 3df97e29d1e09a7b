//! リクエスト分類
//!
//! リクエストをキャッシュ経路に乗せるか、オリジンへ素通しするかを
//! 判定します。パスとCookieのパターンはすべてglobで設定から与えられ、
//! 起動時にコンパイルされます。

use crate::config::{CacheSection, ClassifierSection};
use std::io;

/// キャッシュ可能なリクエストのルート種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// 動的ページ
    Page,
    /// 静的アセット（拡張子で判定）
    StaticAsset,
}

/// 素通しの理由（アクセスログ用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
    /// GET/HEAD以外のメソッド
    Method,
    /// バイパス対象パス
    BypassPath,
    /// セッション/認証Cookie保持
    SessionCookie,
    /// Authorizationヘッダー保持
    Authorization,
}

impl PassReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassReason::Method => "method",
            PassReason::BypassPath => "bypass-path",
            PassReason::SessionCookie => "session-cookie",
            PassReason::Authorization => "authorization",
        }
    }
}

/// 分類結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// キャッシュ経路に乗せる
    Cacheable(RouteClass),
    /// オリジンへ素通し
    Pass(PassReason),
}

/// リクエスト分類器
pub struct Classifier {
    bypass_paths: Vec<glob::Pattern>,
    session_cookies: Vec<glob::Pattern>,
    tracking_cookies: Vec<glob::Pattern>,
    tracking_params: Vec<glob::Pattern>,
    /// 静的アセット拡張子（小文字）
    static_extensions: Vec<String>,
}

fn compile(patterns: &[String], what: &str) -> io::Result<Vec<glob::Pattern>> {
    patterns
        .iter()
        .map(|p| {
            glob::Pattern::new(p).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid {} pattern '{}': {}", what, p, e),
                )
            })
        })
        .collect()
}

impl Classifier {
    /// 設定からパターンをコンパイルして分類器を作成
    pub fn new(classifier: &ClassifierSection, cache: &CacheSection) -> io::Result<Self> {
        Ok(Self {
            bypass_paths: compile(&classifier.bypass_paths, "bypass path")?,
            session_cookies: compile(&classifier.session_cookies, "session cookie")?,
            tracking_cookies: compile(&classifier.tracking_cookies, "tracking cookie")?,
            tracking_params: compile(&classifier.tracking_params, "tracking param")?,
            static_extensions: cache
                .static_asset_extensions
                .iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
        })
    }

    /// キャッシュキー正規化用のトラッキングパラメータパターン
    #[inline]
    pub fn tracking_params(&self) -> &[glob::Pattern] {
        &self.tracking_params
    }

    /// リクエストを分類
    ///
    /// # Arguments
    ///
    /// * `method` - HTTPメソッド
    /// * `path` - リクエストパス（クエリを含まない）
    /// * `cookie` - Cookieヘッダー値（あれば）
    /// * `has_authorization` - Authorizationヘッダーの有無
    pub fn classify(
        &self,
        method: &[u8],
        path: &str,
        cookie: Option<&[u8]>,
        has_authorization: bool,
    ) -> Decision {
        if !method.eq_ignore_ascii_case(b"GET") && !method.eq_ignore_ascii_case(b"HEAD") {
            return Decision::Pass(PassReason::Method);
        }

        if self.bypass_paths.iter().any(|p| p.matches(path)) {
            return Decision::Pass(PassReason::BypassPath);
        }

        if has_authorization {
            return Decision::Pass(PassReason::Authorization);
        }

        if let Some(cookie) = cookie {
            if self.has_session_cookie(cookie) {
                return Decision::Pass(PassReason::SessionCookie);
            }
        }

        Decision::Cacheable(self.route_class(path))
    }

    /// パスの拡張子からルート種別を判定
    pub fn route_class(&self, path: &str) -> RouteClass {
        let ext = path
            .rsplit('/')
            .next()
            .and_then(|file| file.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase());

        match ext {
            Some(ext) if self.static_extensions.contains(&ext) => RouteClass::StaticAsset,
            _ => RouteClass::Page,
        }
    }

    /// Cookieヘッダーにセッション/認証Cookieが含まれるか
    fn has_session_cookie(&self, cookie: &[u8]) -> bool {
        let cookie_str = match std::str::from_utf8(cookie) {
            Ok(s) => s,
            // UTF-8でないCookieは安全側に倒してセッション扱い
            Err(_) => return true,
        };

        cookie_str.split(';').any(|pair| {
            let name = pair.split('=').next().unwrap_or(pair).trim();
            self.session_cookies.iter().any(|p| p.matches(name))
        })
    }

    /// Cookieヘッダーからトラッキングクッキーを除去
    ///
    /// 全Cookieがトラッキングの場合はNone（ヘッダーごと落とす）
    pub fn scrub_cookies(&self, cookie: &[u8]) -> Option<Vec<u8>> {
        let cookie_str = std::str::from_utf8(cookie).ok()?;

        let kept: Vec<&str> = cookie_str
            .split(';')
            .map(|pair| pair.trim())
            .filter(|pair| !pair.is_empty())
            .filter(|pair| {
                let name = pair.split('=').next().unwrap_or(pair).trim();
                !self.tracking_cookies.iter().any(|p| p.matches(name))
            })
            .collect();

        if kept.is_empty() {
            None
        } else {
            Some(kept.join("; ").into_bytes())
        }
    }
}
