//! ゲートウェイの統合テスト
//!
//! 実際のTCPオリジンを立てて、配信経路（HIT/MISS/stale/素通し）と
//! 無効化・障害時フォールバックの振る舞いを検証します。

mod common;

use common::{body_of, config_for, header_value, run_async, status_of, OriginResponse, TestOrigin};
use gracegate::cache::key::CacheKey;
use gracegate::cache::object::CacheObject;
use gracegate::http::{parse_request, ParseOutcome, ParsedRequest};
use gracegate::proxy::Gateway;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

const CLIENT: &str = "203.0.113.1";
const ADMIN: &str = "127.0.0.1";

fn request(raw: &[u8]) -> ParsedRequest {
    match parse_request(raw) {
        ParseOutcome::Complete(r) => r,
        _ => panic!("bad test request"),
    }
}

fn peer(addr: &str) -> IpAddr {
    addr.parse().unwrap()
}

/// 指定秒数だけ過去に作られたことにしたオブジェクトをストアに仕込む
fn seed_object(gateway: &Gateway, path: &str, body: &[u8], age: u64, ttl: u64, grace: u64, keep: u64) {
    let key = CacheKey::from_request(b"GET", "example.com", path, &[]).unwrap();
    let mut object = CacheObject::new(200, Vec::new(), body.to_vec(), ttl, grace, keep, "seeded");
    object.created_unix = object.created_unix.saturating_sub(age);
    gateway.store().insert(key, Arc::new(object));
}

#[test]
fn miss_then_hit_counts_one_origin_fetch() {
    let origin = TestOrigin::spawn(OriginResponse::ok(b"hello"));
    let gateway = Gateway::new(&config_for(&origin)).unwrap();

    run_async(async move {
        let req = request(b"GET /post HTTP/1.1\r\nHost: example.com\r\n\r\n");

        let first = gateway.handle(&req, Vec::new(), peer(CLIENT)).await;
        assert_eq!(status_of(&first.bytes), 200);
        assert_eq!(header_value(&first.bytes, "x-cache").as_deref(), Some("MISS"));
        assert_eq!(body_of(&first.bytes), b"hello");
        assert_eq!(header_value(&first.bytes, "x-backend").as_deref(), Some("origin01"));

        let second = gateway.handle(&req, Vec::new(), peer(CLIENT)).await;
        assert_eq!(header_value(&second.bytes, "x-cache").as_deref(), Some("HIT"));
        assert_eq!(header_value(&second.bytes, "x-cache-hits").as_deref(), Some("2"));
        assert_eq!(body_of(&second.bytes), b"hello");
    });

    assert_eq!(origin.hit_count(), 1);
}

#[test]
fn concurrent_misses_collapse_to_single_fetch() {
    let origin = TestOrigin::spawn(
        OriginResponse::ok(b"slow page").with_delay(Duration::from_millis(100)),
    );
    let gateway = Gateway::new(&config_for(&origin)).unwrap();

    run_async(async move {
        let mut tasks = Vec::new();
        for _ in 0..50 {
            let gw = Arc::clone(&gateway);
            tasks.push(monoio::spawn(async move {
                let req = request(b"GET /burst HTTP/1.1\r\nHost: example.com\r\n\r\n");
                gw.handle(&req, Vec::new(), peer(CLIENT)).await
            }));
        }

        for task in tasks {
            let handled = task.await;
            assert_eq!(status_of(&handled.bytes), 200);
            assert_eq!(body_of(&handled.bytes), b"slow page");
        }
    });

    // 50並列が1本のフェッチに合流する
    assert_eq!(origin.hit_count(), 1);
}

#[test]
fn stale_grace_serves_immediately_and_revalidates_in_background() {
    let origin = TestOrigin::spawn(OriginResponse::ok(b"fresh"));
    let gateway = Gateway::new(&config_for(&origin)).unwrap();

    // TTL切れ・grace内のオブジェクトを仕込む
    seed_object(&gateway, "/post", b"stale", 400, 300, 86_400, 604_800);

    run_async(async move {
        let req = request(b"GET /post HTTP/1.1\r\nHost: example.com\r\n\r\n");

        // stale配信は即時。オリジンを待たない
        let first = gateway.handle(&req, Vec::new(), peer(CLIENT)).await;
        assert_eq!(header_value(&first.bytes, "x-cache").as_deref(), Some("STALE_GRACE"));
        assert_eq!(body_of(&first.bytes), b"stale");

        // バックグラウンド再検証の完了を待つ
        monoio::time::sleep(Duration::from_millis(300)).await;

        let second = gateway.handle(&req, Vec::new(), peer(CLIENT)).await;
        assert_eq!(header_value(&second.bytes, "x-cache").as_deref(), Some("HIT"));
        assert_eq!(body_of(&second.bytes), b"fresh");
    });

    assert_eq!(origin.hit_count(), 1);
}

#[test]
fn sick_backend_serves_stale_keep_without_origin_contact() {
    let origin = TestOrigin::spawn(OriginResponse::ok(b"unused"));
    let gateway = Gateway::new(&config_for(&origin)).unwrap();

    // grace超過・keep内
    seed_object(&gateway, "/post", b"old copy", 300 + 86_400 + 100, 300, 86_400, 604_800);
    gateway.registry().targets()[0].set_healthy(false);

    run_async(async move {
        let req = request(b"GET /post HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let handled = gateway.handle(&req, Vec::new(), peer(CLIENT)).await;
        assert_eq!(status_of(&handled.bytes), 200);
        assert_eq!(header_value(&handled.bytes, "x-cache").as_deref(), Some("STALE_KEEP"));
        assert_eq!(body_of(&handled.bytes), b"old copy");
    });

    // sickの間はネットワークに一切出ない
    assert_eq!(origin.hit_count(), 0);
}

#[test]
fn sick_backend_miss_gets_maintenance_page() {
    let origin = TestOrigin::spawn(OriginResponse::ok(b"unused"));
    let gateway = Gateway::new(&config_for(&origin)).unwrap();
    gateway.registry().targets()[0].set_healthy(false);

    run_async(async move {
        let req = request(b"GET /nothing HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let handled = gateway.handle(&req, Vec::new(), peer(CLIENT)).await;
        assert_eq!(status_of(&handled.bytes), 503);
        assert!(String::from_utf8_lossy(&body_of(&handled.bytes)).contains("Service Unavailable"));
    });

    assert_eq!(origin.hit_count(), 0);
}

#[test]
fn blocking_revalidation_failure_falls_back_to_stale_keep() {
    // 接続拒否されるポートをオリジンにする
    let dead_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = gracegate::config::ProxyConfig {
        backend: vec![gracegate::config::BackendSection {
            id: "dead".to_string(),
            host: "127.0.0.1".to_string(),
            port: dead_port,
        }],
        ..Default::default()
    };
    let gateway = Gateway::new(&config).unwrap();

    // keep内。フラグ上はhealthyなので同期再検証を試みて失敗する
    seed_object(&gateway, "/post", b"survivor", 300 + 86_400 + 100, 300, 86_400, 604_800);

    run_async(async move {
        let req = request(b"GET /post HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let handled = gateway.handle(&req, Vec::new(), peer(CLIENT)).await;
        assert_eq!(status_of(&handled.bytes), 200);
        assert_eq!(header_value(&handled.bytes, "x-cache").as_deref(), Some("STALE_KEEP"));
        assert_eq!(body_of(&handled.bytes), b"survivor");
    });
}

#[test]
fn origin_5xx_during_blocking_revalidation_serves_stale_keep() {
    // healthyだがエラーを返すオリジン
    let origin = TestOrigin::spawn(OriginResponse::ok(b"broken").with_status(503));
    let gateway = Gateway::new(&config_for(&origin)).unwrap();

    // grace超過・keep内。同期再検証が503を受ける
    seed_object(&gateway, "/post", b"survivor", 300 + 86_400 + 100, 300, 86_400, 604_800);

    run_async(async move {
        let req = request(b"GET /post HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let handled = gateway.handle(&req, Vec::new(), peer(CLIENT)).await;

        // 5xxはクライアントへ流さず、手元のコピーをstale-if-errorで配信
        assert_eq!(status_of(&handled.bytes), 200);
        assert_eq!(header_value(&handled.bytes, "x-cache").as_deref(), Some("STALE_KEEP"));
        assert_eq!(body_of(&handled.bytes), b"survivor");
    });

    assert_eq!(origin.hit_count(), 1);
}

#[test]
fn purge_requires_acl_and_is_idempotent() {
    let origin = TestOrigin::spawn(OriginResponse::ok(b"page"));
    let gateway = Gateway::new(&config_for(&origin)).unwrap();

    seed_object(&gateway, "/post", b"page", 0, 300, 600, 600);
    let key = CacheKey::from_request(b"GET", "example.com", "/post", &[]).unwrap();

    run_async(async move {
        let req = request(b"PURGE /post HTTP/1.1\r\nHost: example.com\r\n\r\n");

        // 許可されていない送信元は403で、何も消えない
        let denied = gateway.handle(&req, Vec::new(), peer(CLIENT)).await;
        assert_eq!(status_of(&denied.bytes), 403);
        assert!(gateway.store().lookup(&key).is_some());

        let first = gateway.handle(&req, Vec::new(), peer(ADMIN)).await;
        assert_eq!(status_of(&first.bytes), 200);
        assert!(gateway.store().lookup(&key).is_none());

        // 2回目も200（冪等）
        let second = gateway.handle(&req, Vec::new(), peer(ADMIN)).await;
        assert_eq!(status_of(&second.bytes), 200);
    });
}

#[test]
fn ban_pattern_removes_matching_entries() {
    let origin = TestOrigin::spawn(OriginResponse::ok(b"page"));
    let gateway = Gateway::new(&config_for(&origin)).unwrap();

    seed_object(&gateway, "/api/a", b"a", 0, 300, 600, 600);
    seed_object(&gateway, "/api/b", b"b", 0, 300, 600, 600);
    seed_object(&gateway, "/page", b"c", 0, 300, 600, 600);

    run_async(async move {
        let req = request(
            b"BAN / HTTP/1.1\r\nHost: example.com\r\nX-Ban-Pattern: example.com/api/*\r\n\r\n",
        );
        let handled = gateway.handle(&req, Vec::new(), peer(ADMIN)).await;
        assert_eq!(status_of(&handled.bytes), 200);
        assert_eq!(String::from_utf8_lossy(&body_of(&handled.bytes)), "removed 2\n");

        let api_key = CacheKey::from_request(b"GET", "example.com", "/api/a", &[]).unwrap();
        let page_key = CacheKey::from_request(b"GET", "example.com", "/page", &[]).unwrap();
        assert!(gateway.store().lookup(&api_key).is_none());
        assert!(gateway.store().lookup(&page_key).is_some());
    });
}

#[test]
fn pass_requests_reach_origin_every_time() {
    let origin = TestOrigin::spawn(OriginResponse::ok(b"result"));
    let gateway = Gateway::new(&config_for(&origin)).unwrap();

    run_async(async move {
        let req = request(
            b"POST /form HTTP/1.1\r\nHost: example.com\r\nContent-Length: 3\r\n\r\n",
        );

        for _ in 0..2 {
            let handled = gateway.handle(&req, b"a=1".to_vec(), peer(CLIENT)).await;
            assert_eq!(status_of(&handled.bytes), 200);
            assert_eq!(header_value(&handled.bytes, "x-cache").as_deref(), Some("PASS"));
        }
    });

    // 素通しは合流もキャッシュもしない
    assert_eq!(origin.hit_count(), 2);
}

#[test]
fn session_cookie_bypasses_cache() {
    let origin = TestOrigin::spawn(OriginResponse::ok(b"personal"));
    let gateway = Gateway::new(&config_for(&origin)).unwrap();

    run_async(async move {
        let req = request(
            b"GET /post HTTP/1.1\r\nHost: example.com\r\nCookie: wordpress_logged_in_x=u\r\n\r\n",
        );

        for _ in 0..2 {
            let handled = gateway.handle(&req, Vec::new(), peer(CLIENT)).await;
            assert_eq!(header_value(&handled.bytes, "x-cache").as_deref(), Some("PASS"));
        }
    });

    assert_eq!(origin.hit_count(), 2);
}

#[test]
fn tracking_params_share_one_cache_entry() {
    let origin = TestOrigin::spawn(OriginResponse::ok(b"campaign page"));
    let gateway = Gateway::new(&config_for(&origin)).unwrap();

    run_async(async move {
        let with_tracking = request(
            b"GET /post?utm_source=mail&utm_campaign=x HTTP/1.1\r\nHost: example.com\r\n\r\n",
        );
        let plain = request(b"GET /post HTTP/1.1\r\nHost: example.com\r\n\r\n");

        let first = gateway.handle(&with_tracking, Vec::new(), peer(CLIENT)).await;
        assert_eq!(header_value(&first.bytes, "x-cache").as_deref(), Some("MISS"));

        // トラッキングパラメータ抜きでも同じエントリに当たる
        let second = gateway.handle(&plain, Vec::new(), peer(CLIENT)).await;
        assert_eq!(header_value(&second.bytes, "x-cache").as_deref(), Some("HIT"));
    });

    assert_eq!(origin.hit_count(), 1);
}

#[test]
fn set_cookie_page_served_but_not_stored() {
    let origin = TestOrigin::spawn(
        OriginResponse::ok(b"cookied").with_header("Set-Cookie", "s=1"),
    );
    let gateway = Gateway::new(&config_for(&origin)).unwrap();

    run_async(async move {
        let req = request(b"GET /post HTTP/1.1\r\nHost: example.com\r\n\r\n");

        let first = gateway.handle(&req, Vec::new(), peer(CLIENT)).await;
        assert_eq!(status_of(&first.bytes), 200);
        let key = CacheKey::from_request(b"GET", "example.com", "/post", &[]).unwrap();
        assert!(gateway.store().lookup(&key).is_none());
    });

    assert_eq!(origin.hit_count(), 1);
}

#[test]
fn origin_5xx_never_overwrites_good_copy() {
    let origin = TestOrigin::spawn(OriginResponse::ok(b"broken").with_status(503));
    let gateway = Gateway::new(&config_for(&origin)).unwrap();

    // grace内のstaleを仕込む。再検証先のオリジンは503を返す
    seed_object(&gateway, "/post", b"good copy", 400, 300, 86_400, 604_800);

    run_async(async move {
        let req = request(b"GET /post HTTP/1.1\r\nHost: example.com\r\n\r\n");

        let first = gateway.handle(&req, Vec::new(), peer(CLIENT)).await;
        assert_eq!(header_value(&first.bytes, "x-cache").as_deref(), Some("STALE_GRACE"));

        monoio::time::sleep(Duration::from_millis(300)).await;

        // 503は格納されず、手元の正常コピーが残る
        let second = gateway.handle(&req, Vec::new(), peer(CLIENT)).await;
        assert_eq!(header_value(&second.bytes, "x-cache").as_deref(), Some("STALE_GRACE"));
        assert_eq!(body_of(&second.bytes), b"good copy");
    });
}
