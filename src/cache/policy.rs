//! 格納ポリシー
//!
//! Cache-Controlヘッダーの解析と、レスポンスをどのttl/grace/keepで
//! 格納するか（あるいは格納しないか）の判定を行います。

use crate::classify::RouteClass;
use crate::config::CacheSection;

/// Cache-Control ディレクティブ
#[derive(Debug, Clone, Default)]
pub struct CacheDirectives {
    /// max-age（秒）
    pub max_age: Option<u64>,
    /// s-maxage（秒、プロキシ用）
    pub s_maxage: Option<u64>,
    /// no-cache フラグ
    pub no_cache: bool,
    /// no-store フラグ
    pub no_store: bool,
    /// private フラグ
    pub private: bool,
    /// public フラグ
    pub public: bool,
}

impl CacheDirectives {
    /// Cache-Controlヘッダー値をパース
    pub fn parse(value: &[u8]) -> Self {
        let mut cc = Self::default();

        let value_str = match std::str::from_utf8(value) {
            Ok(s) => s,
            Err(_) => return cc,
        };

        for directive in value_str.split(',') {
            let directive = directive.trim().to_lowercase();

            if directive == "no-cache" {
                cc.no_cache = true;
            } else if directive == "no-store" {
                cc.no_store = true;
            } else if directive == "private" {
                cc.private = true;
            } else if directive == "public" {
                cc.public = true;
            } else if let Some(value) = directive.strip_prefix("max-age=") {
                cc.max_age = value.parse().ok();
            } else if let Some(value) = directive.strip_prefix("s-maxage=") {
                cc.s_maxage = value.parse().ok();
            }
        }

        cc
    }

    /// レスポンスヘッダーからパース（ヘッダーがなければデフォルト）
    pub fn from_headers(headers: &[(Box<[u8]>, Box<[u8]>)]) -> Self {
        headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(b"cache-control"))
            .map(|(_, value)| Self::parse(value))
            .unwrap_or_default()
    }

    /// プロキシで格納禁止かどうか
    #[inline]
    pub fn forbids_store(&self) -> bool {
        self.no_store || self.private
    }

    /// プロキシ用のTTL（秒）を取得
    ///
    /// 優先順位: s-maxage > max-age > デフォルト
    pub fn effective_ttl(&self, default_ttl: u64) -> u64 {
        self.s_maxage.or(self.max_age).unwrap_or(default_ttl)
    }
}

/// 格納判定の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePolicy {
    /// 格納しない。既存オブジェクトがあればそのまま残す
    DontStore,
    /// 指定ウィンドウで格納する
    Store {
        ttl_secs: u64,
        grace_secs: u64,
        keep_secs: u64,
        /// 格納コピーからSet-Cookieを取り除く（静的アセット）
        strip_set_cookie: bool,
    },
}

impl StorePolicy {
    #[inline]
    pub fn is_store(&self) -> bool {
        matches!(self, StorePolicy::Store { .. })
    }
}

/// 格納ポリシーの解決器
///
/// ステータスコード、ルート種別、Cache-Control、Set-Cookieの有無から
/// ttl/grace/keepを確定します。5xxは決して格納せず、手元の正常な
/// オブジェクトを上書きしません。
pub struct PolicyResolver {
    cache: CacheSection,
}

impl PolicyResolver {
    pub fn new(cache: CacheSection) -> Self {
        Self { cache }
    }

    /// レスポンスの格納可否とウィンドウを決定
    pub fn resolve(
        &self,
        route: RouteClass,
        status_code: u16,
        headers: &[(Box<[u8]>, Box<[u8]>)],
    ) -> StorePolicy {
        let cc = CacheDirectives::from_headers(headers);
        if cc.forbids_store() {
            return StorePolicy::DontStore;
        }

        let has_set_cookie = headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case(b"set-cookie"));

        match status_code {
            // リダイレクトは短命で格納
            301 | 302 | 307 | 308 => {
                if has_set_cookie {
                    return StorePolicy::DontStore;
                }
                StorePolicy::Store {
                    ttl_secs: self.cache.redirect_ttl_secs,
                    grace_secs: self.cache.redirect_grace_secs,
                    keep_secs: self.cache.default_keep_secs,
                    strip_set_cookie: false,
                }
            }

            // 404/410もページと同じ扱いで格納（存在しないことも情報）
            200 | 203 | 204 | 404 | 410 => match route {
                RouteClass::StaticAsset => StorePolicy::Store {
                    // 静的アセットは運用側のウィンドウで統一し、
                    // 誤って付いたSet-Cookieは格納コピーから除く
                    ttl_secs: self.cache.static_ttl_secs,
                    grace_secs: self.cache.static_grace_secs,
                    keep_secs: self.cache.default_keep_secs,
                    strip_set_cookie: true,
                },
                RouteClass::Page => {
                    if has_set_cookie {
                        return StorePolicy::DontStore;
                    }
                    let mut ttl = cc.effective_ttl(self.cache.default_ttl_secs);
                    // max-age=0でもCookieなしなら最小鮮度ウィンドウを与えて
                    // スタンピードを防ぐ
                    if ttl == 0 {
                        ttl = self.cache.min_fresh_secs;
                    }
                    StorePolicy::Store {
                        ttl_secs: ttl,
                        grace_secs: self.cache.default_grace_secs,
                        keep_secs: self.cache.default_keep_secs,
                        strip_set_cookie: false,
                    }
                }
            },

            // 5xxとその他のステータスは格納しない
            _ => StorePolicy::DontStore,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> PolicyResolver {
        PolicyResolver::new(CacheSection::default())
    }

    fn header(name: &[u8], value: &[u8]) -> (Box<[u8]>, Box<[u8]>) {
        (name.to_vec().into(), value.to_vec().into())
    }

    #[test]
    fn test_parse_directives() {
        let cc = CacheDirectives::parse(b"max-age=3600, public");
        assert_eq!(cc.max_age, Some(3600));
        assert!(cc.public);
        assert!(!cc.forbids_store());

        let cc = CacheDirectives::parse(b"max-age=300, s-maxage=600");
        assert_eq!(cc.effective_ttl(100), 600); // s-maxageが優先
    }

    #[test]
    fn test_no_store_and_private() {
        let r = resolver();
        let h = vec![header(b"cache-control", b"no-store")];
        assert_eq!(r.resolve(RouteClass::Page, 200, &h), StorePolicy::DontStore);

        let h = vec![header(b"cache-control", b"private, max-age=300")];
        assert_eq!(r.resolve(RouteClass::Page, 200, &h), StorePolicy::DontStore);
    }

    #[test]
    fn test_server_error_never_stored() {
        let r = resolver();
        for status in [500, 502, 503, 504] {
            assert_eq!(r.resolve(RouteClass::Page, status, &[]), StorePolicy::DontStore);
        }
    }

    #[test]
    fn test_page_with_set_cookie_not_stored() {
        let r = resolver();
        let h = vec![header(b"set-cookie", b"session=abc")];
        assert_eq!(r.resolve(RouteClass::Page, 200, &h), StorePolicy::DontStore);
    }

    #[test]
    fn test_page_ttl_from_cache_control() {
        let r = resolver();
        let h = vec![header(b"cache-control", b"max-age=3600")];
        assert_eq!(
            r.resolve(RouteClass::Page, 200, &h),
            StorePolicy::Store {
                ttl_secs: 3600,
                grace_secs: 86_400,
                keep_secs: 604_800,
                strip_set_cookie: false,
            }
        );
    }

    #[test]
    fn test_page_max_age_zero_gets_min_fresh() {
        let r = resolver();
        let h = vec![header(b"cache-control", b"max-age=0")];
        match r.resolve(RouteClass::Page, 200, &h) {
            StorePolicy::Store { ttl_secs, .. } => assert_eq!(ttl_secs, 10),
            other => panic!("expected Store, got {:?}", other),
        }
    }

    #[test]
    fn test_static_asset_long_windows_and_strip() {
        let r = resolver();
        // Set-Cookie付きでも静的アセットは格納し、Cookieだけ落とす
        let h = vec![header(b"set-cookie", b"junk=1")];
        assert_eq!(
            r.resolve(RouteClass::StaticAsset, 200, &h),
            StorePolicy::Store {
                ttl_secs: 86_400,
                grace_secs: 604_800,
                keep_secs: 604_800,
                strip_set_cookie: true,
            }
        );
    }

    #[test]
    fn test_redirect_short_windows() {
        let r = resolver();
        assert_eq!(
            r.resolve(RouteClass::Page, 301, &[]),
            StorePolicy::Store {
                ttl_secs: 60,
                grace_secs: 600,
                keep_secs: 604_800,
                strip_set_cookie: false,
            }
        );
        // Set-Cookie付きリダイレクトは格納しない
        let h = vec![header(b"set-cookie", b"s=1")];
        assert_eq!(r.resolve(RouteClass::Page, 302, &h), StorePolicy::DontStore);
    }

    #[test]
    fn test_not_found_stored() {
        let r = resolver();
        assert!(r.resolve(RouteClass::Page, 404, &[]).is_store());
    }
}
