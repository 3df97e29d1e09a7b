//! キャッシュサブシステム
//!
//! stale許容型キャッシュの中核。キー導出、オブジェクト、鮮度ステートマシン、
//! 格納ポリシー、ストア、無効化（PURGE/BAN）の各モジュールで構成されます。

pub mod ban;
pub mod key;
pub mod object;
pub mod policy;
pub mod state;
pub mod store;

pub use ban::BanList;
pub use key::{CacheKey, CacheableMethod};
pub use object::{now_unix, CacheObject};
pub use policy::{CacheDirectives, PolicyResolver, StorePolicy};
pub use state::{decide, CacheStatus, Freshness, LookupAction};
pub use store::ObjectStore;
