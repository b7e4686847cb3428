//! Identity resolution against a real Redis and a mocked authority.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakePlatform, player, redis_url};
use rollcall_server::identity::offline_uuid;
use rollcall_server::{IdentityResolver, MojangAuthority, RedisConfig, StoreAccess};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn store() -> StoreAccess {
    let config = RedisConfig {
        url: redis_url().await,
        ..RedisConfig::default()
    };
    StoreAccess::connect(&config).await.expect("connect store")
}

async fn resolver(
    server: &MockServer,
    platform: Arc<FakePlatform>,
    ttl: Duration,
    online_mode: bool,
) -> IdentityResolver {
    let authority = MojangAuthority::new(server.uri(), Duration::from_secs(2)).unwrap();
    IdentityResolver::new(store().await, platform, Arc::new(authority), ttl, online_mode)
}

/// A name nobody else in this test binary uses.
fn unique_name(prefix: &str) -> String {
    format!("{prefix}{}", &Uuid::new_v4().simple().to_string()[..6])
}

#[tokio::test]
async fn test_authority_result_is_cached() {
    let server = MockServer::start().await;
    let name = unique_name("Jeb");
    let uuid = Uuid::new_v4();
    Mock::given(method("POST"))
        .and(path("/profiles/minecraft"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": uuid.simple().to_string(), "name": name }
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let resolver = resolver(&server, Arc::default(), Duration::from_secs(3600), true).await;
    let lower = name.to_lowercase();
    assert_eq!(resolver.resolve_uuid(&lower, true).await, Some(uuid));
    // Second lookup is served from memory; the mock verifies a single call on drop.
    assert_eq!(resolver.resolve_uuid(&name, true).await, Some(uuid));
    assert_eq!(resolver.resolve_name(&uuid, false).await, Some(name));
}

#[tokio::test]
async fn test_shared_cache_serves_other_resolvers() {
    let server = MockServer::start().await;
    let name = unique_name("Dinnerbone");
    let uuid = Uuid::new_v4();

    let first = resolver(&server, Arc::default(), Duration::from_secs(3600), true).await;
    first.remember(&name, uuid).await;

    let silent = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&silent)
        .await;
    let second = resolver(&silent, Arc::default(), Duration::from_secs(3600), true).await;
    assert_eq!(second.resolve_uuid(&name, false).await, Some(uuid));
    assert_eq!(second.resolve_name(&uuid, false).await, Some(name));
}

#[tokio::test]
async fn test_unknown_name_without_external_lookup() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&server)
        .await;

    let resolver = resolver(&server, Arc::default(), Duration::from_secs(3600), true).await;
    assert_eq!(resolver.resolve_uuid(&unique_name("Nobody"), false).await, None);
}

#[tokio::test]
async fn test_authority_miss_and_failure_are_none() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/profiles/minecraft"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    let missing = Uuid::new_v4();
    Mock::given(method("GET"))
        .and(path(format!("/user/profiles/{}/names", missing.simple())))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let resolver = resolver(&server, Arc::default(), Duration::from_secs(3600), true).await;
    assert_eq!(resolver.resolve_uuid(&unique_name("Ghost"), true).await, None);
    assert_eq!(resolver.resolve_name(&missing, true).await, None);
}

#[tokio::test]
async fn test_name_lookup_takes_latest_name() {
    let server = MockServer::start().await;
    let uuid = Uuid::new_v4();
    let latest = unique_name("Renamed");
    Mock::given(method("GET"))
        .and(path(format!("/user/profiles/{}/names", uuid.simple())))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "name": "Original" },
            { "name": latest, "changedToAt": 1_500_000_000_000_i64 }
        ])))
        .mount(&server)
        .await;

    let resolver = resolver(&server, Arc::default(), Duration::from_secs(3600), true).await;
    assert_eq!(resolver.resolve_name(&uuid, true).await, Some(latest.clone()));
    assert_eq!(resolver.resolve_uuid(&latest, false).await, Some(uuid));
}

#[tokio::test]
async fn test_local_player_and_literal_uuid_short_circuit() {
    let server = MockServer::start().await;
    let platform = Arc::new(FakePlatform::default());
    let online = player("LocalHero", Some("lobby"));
    platform.add(online.clone());

    let resolver = resolver(&server, platform, Duration::from_secs(3600), true).await;
    assert_eq!(resolver.resolve_uuid("localhero", false).await, Some(online.uuid));
    assert_eq!(resolver.resolve_name(&online.uuid, false).await, Some("LocalHero".into()));

    let literal = Uuid::new_v4();
    assert_eq!(resolver.resolve_uuid(&literal.to_string(), false).await, Some(literal));
    assert_eq!(resolver.resolve_uuid(&literal.simple().to_string(), false).await, Some(literal));
}

#[tokio::test]
async fn test_offline_mode_derives_uuid() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let resolver = resolver(&server, Arc::default(), Duration::from_secs(3600), false).await;
    assert_eq!(
        resolver.resolve_uuid("Notch", true).await,
        Some(offline_uuid("Notch"))
    );
}

#[tokio::test]
async fn test_expired_entries_are_purged() {
    let server = MockServer::start().await;
    let name = unique_name("Brief");
    let uuid = Uuid::new_v4();

    let resolver = resolver(&server, Arc::default(), Duration::from_millis(1), true).await;
    resolver.remember(&name, uuid).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(resolver.purge_expired().await.unwrap() >= 2);
    assert_eq!(resolver.resolve_uuid(&name, false).await, None);
    assert_eq!(resolver.resolve_name(&uuid, false).await, None);
}

#[tokio::test]
async fn test_expired_entry_is_a_miss_before_purge() {
    let server = MockServer::start().await;
    let name = unique_name("Fleeting");
    let uuid = Uuid::new_v4();

    let writer = resolver(&server, Arc::default(), Duration::from_millis(1), true).await;
    writer.remember(&name, uuid).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let reader = resolver(&server, Arc::default(), Duration::from_secs(3600), true).await;
    assert_eq!(reader.resolve_uuid(&name, false).await, None);
}

#[tokio::test]
async fn test_expired_entry_is_fetched_again() {
    let server = MockServer::start().await;
    let name = unique_name("Returning");
    let uuid = Uuid::new_v4();
    Mock::given(method("POST"))
        .and(path("/profiles/minecraft"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": uuid.simple().to_string(), "name": name }
        ])))
        .expect(2)
        .mount(&server)
        .await;

    let resolver = resolver(&server, Arc::default(), Duration::from_millis(1), true).await;
    assert_eq!(resolver.resolve_uuid(&name, true).await, Some(uuid));
    tokio::time::sleep(Duration::from_millis(20)).await;
    // Both cache tiers have expired; the authority answers again.
    assert_eq!(resolver.resolve_uuid(&name, true).await, Some(uuid));
}

#[tokio::test]
async fn test_offline_mode_prefers_remembered_uuid() {
    let server = MockServer::start().await;
    let name = unique_name("Premium");
    let remembered = Uuid::new_v4();

    let resolver = resolver(&server, Arc::default(), Duration::from_secs(3600), false).await;
    resolver.remember(&name, remembered).await;
    assert_eq!(resolver.resolve_uuid(&name, false).await, Some(remembered));
    assert_ne!(offline_uuid(&name), remembered);

    // Names nobody remembered still derive their offline uuid.
    let stranger = unique_name("Cracked");
    assert_eq!(
        resolver.resolve_uuid(&stranger, false).await,
        Some(offline_uuid(&stranger))
    );
}
