//! Tests for [`QuotaResolver`]: tokens, account lookups, fallbacks.

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use skald::{
    CallerIdentity, Claims, HttpAccountLookup, JwtVerifier, LimitsSource, QuotaConfig,
    QuotaResolver, SkaldError, TokenVerifier,
};

const SECRET: &[u8] = b"test-secret";

fn token_resolver(config: QuotaConfig) -> (QuotaResolver, JwtVerifier) {
    let resolver = QuotaResolver::new(config).with_verifier(Arc::new(JwtVerifier::new(SECRET)));
    (resolver, JwtVerifier::new(SECRET))
}

fn account_resolver(server: &MockServer, config: QuotaConfig) -> QuotaResolver {
    QuotaResolver::new(config).with_account_lookup(Arc::new(HttpAccountLookup::new(server.uri())))
}

fn limits_body(max_text_length: usize) -> serde_json::Value {
    serde_json::json!({
        "max_text_length": max_text_length,
        "max_check_time_ms": 5000,
        "request_quota": 120,
        "premium": false,
    })
}

// ============================================================================
// Tokens
// ============================================================================

#[tokio::test]
async fn valid_token_sets_limits() {
    let (resolver, signer) = token_resolver(QuotaConfig::default());
    let token = signer
        .sign(
            &Claims::new("acct-1", Duration::from_secs(300))
                .max_text_length(50_000)
                .max_check_time(Duration::from_secs(8))
                .request_quota(600),
        )
        .unwrap();

    let limits = resolver
        .resolve(&CallerIdentity::ip("10.0.0.1").token(token), false)
        .await
        .unwrap();

    assert_eq!(limits.source(), LimitsSource::Token);
    assert_eq!(limits.account_id(), Some("acct-1"));
    assert_eq!(limits.max_text_length(), 50_000);
    assert_eq!(limits.max_check_duration(), Some(Duration::from_secs(8)));
    assert_eq!(limits.request_quota(), Some(600));
    assert!(!limits.is_premium());
}

#[tokio::test]
async fn token_without_length_claim_uses_account_default() {
    let (resolver, signer) =
        token_resolver(QuotaConfig::new().account_max_text_length(77_777));
    let token = signer
        .sign(&Claims::new("acct-2", Duration::from_secs(300)).premium(true))
        .unwrap();

    let limits = resolver
        .resolve(&CallerIdentity::default().token(token), false)
        .await
        .unwrap();
    assert_eq!(limits.max_text_length(), 77_777);
    assert!(limits.is_premium());
}

#[tokio::test]
async fn forged_token_degrades_to_anonymous() {
    let (resolver, _) = token_resolver(QuotaConfig::new().anonymous_max_text_length(1_000));
    let forged = JwtVerifier::new(b"other-secret")
        .sign(&Claims::new("acct-1", Duration::from_secs(300)).max_text_length(1_000_000))
        .unwrap();

    let limits = resolver
        .resolve(&CallerIdentity::ip("10.0.0.1").token(forged), false)
        .await
        .unwrap();
    assert_eq!(limits.source(), LimitsSource::Anonymous);
    assert_eq!(limits.max_text_length(), 1_000);
}

#[tokio::test]
async fn strict_auth_rejects_bad_token() {
    let (resolver, _) = token_resolver(QuotaConfig::default());
    let caller = CallerIdentity::ip("10.0.0.1").token("not-a-jwt");

    let err = resolver.resolve(&caller, true).await.unwrap_err();
    assert!(matches!(err, SkaldError::InvalidToken(_)));
    assert_eq!(err.status_code(), 401);
}

#[tokio::test]
async fn strict_auth_from_config() {
    let (resolver, _) = token_resolver(QuotaConfig::new().strict_auth(true));
    let caller = CallerIdentity::default().token("not-a-jwt");
    assert!(resolver.resolve(&caller, false).await.is_err());
}

#[test]
fn expired_token_is_invalid() {
    let verifier = JwtVerifier::new(SECRET);
    let mut claims = Claims::new("acct-1", Duration::ZERO);
    claims.exp -= 60;
    let token = verifier.sign(&claims).unwrap();
    assert!(matches!(
        verifier.verify(&token),
        Err(SkaldError::InvalidToken(_))
    ));
}

// ============================================================================
// Account lookup
// ============================================================================

#[tokio::test]
async fn account_lookup_sets_limits() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/accounts/acct-9/limits"))
        .and(header("authorization", "Bearer key-9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(limits_body(40_000)))
        .mount(&server)
        .await;

    let resolver = account_resolver(&server, QuotaConfig::default());
    let limits = resolver
        .resolve(&CallerIdentity::ip("10.0.0.1").account("acct-9", "key-9"), false)
        .await
        .unwrap();

    assert_eq!(limits.source(), LimitsSource::Account);
    assert_eq!(limits.account_id(), Some("acct-9"));
    assert_eq!(limits.max_text_length(), 40_000);
    assert_eq!(limits.max_check_duration(), Some(Duration::from_secs(5)));
    assert_eq!(limits.request_quota(), Some(120));
}

#[tokio::test]
async fn account_lookups_are_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/accounts/acct-9/limits"))
        .respond_with(ResponseTemplate::new(200).set_body_json(limits_body(40_000)))
        .expect(1)
        .mount(&server)
        .await;

    let resolver = account_resolver(&server, QuotaConfig::default());
    let caller = CallerIdentity::default().account("acct-9", "key-9");
    for _ in 0..3 {
        let limits = resolver.resolve(&caller, false).await.unwrap();
        assert_eq!(limits.max_text_length(), 40_000);
    }
}

#[tokio::test]
async fn unknown_account_is_anonymous() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let resolver = account_resolver(&server, QuotaConfig::new().anonymous_max_text_length(123));
    let caller = CallerIdentity::default().account("ghost", "key-0");
    for _ in 0..2 {
        let limits = resolver.resolve(&caller, false).await.unwrap();
        assert_eq!(limits.source(), LimitsSource::Anonymous);
        assert_eq!(limits.max_text_length(), 123);
    }
}

#[tokio::test]
async fn rejected_api_key_is_anonymous() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/accounts/acct-9/limits"))
        .and(header("authorization", "Bearer key-9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(limits_body(40_000)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/accounts/acct-9/limits"))
        .and(header("authorization", "Bearer guessed"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let resolver = account_resolver(&server, QuotaConfig::default());
    let limits = resolver
        .resolve(&CallerIdentity::default().account("acct-9", "key-9"), false)
        .await
        .unwrap();
    assert_eq!(limits.source(), LimitsSource::Account);

    // The cached answer for the real key is not reused for another key.
    for _ in 0..2 {
        let limits = resolver
            .resolve(&CallerIdentity::default().account("acct-9", "guessed"), false)
            .await
            .unwrap();
        assert_eq!(limits.source(), LimitsSource::Anonymous);
    }
}

#[tokio::test]
async fn account_without_api_key_skips_lookup() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(limits_body(40_000)))
        .expect(0)
        .mount(&server)
        .await;

    let resolver = account_resolver(&server, QuotaConfig::default());
    let mut caller = CallerIdentity::ip("10.0.0.1");
    caller.account_id = Some("acct-9".into());
    let limits = resolver.resolve(&caller, false).await.unwrap();
    assert_eq!(limits.source(), LimitsSource::Anonymous);
}

#[tokio::test]
async fn account_id_is_escaped_in_lookup_path() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/accounts/x%2F..%2Fadmin/limits"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let resolver = account_resolver(&server, QuotaConfig::default());
    let limits = resolver
        .resolve(&CallerIdentity::default().account("x/../admin", "key"), false)
        .await
        .unwrap();
    assert_eq!(limits.source(), LimitsSource::Anonymous);
}

#[tokio::test]
async fn failing_account_service_degrades_and_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let resolver = account_resolver(&server, QuotaConfig::default());
    let caller = CallerIdentity::default().account("acct-9", "key-9");
    for _ in 0..2 {
        let limits = resolver.resolve(&caller, false).await.unwrap();
        assert_eq!(limits.source(), LimitsSource::Anonymous);
    }
}

#[tokio::test]
async fn slow_account_service_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(limits_body(40_000))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let resolver = account_resolver(
        &server,
        QuotaConfig::new().account_lookup_timeout(Duration::from_millis(100)),
    );
    let limits = resolver
        .resolve(&CallerIdentity::default().account("acct-9", "key-9"), false)
        .await
        .unwrap();
    assert_eq!(limits.source(), LimitsSource::Anonymous);
}

#[tokio::test]
async fn malformed_account_body_degrades() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let resolver = account_resolver(&server, QuotaConfig::default());
    let limits = resolver
        .resolve(&CallerIdentity::default().account("acct-9", "key-9"), false)
        .await
        .unwrap();
    assert_eq!(limits.source(), LimitsSource::Anonymous);
}

#[tokio::test]
async fn token_takes_precedence_over_account() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(limits_body(40_000)))
        .expect(0)
        .mount(&server)
        .await;

    let signer = JwtVerifier::new(SECRET);
    let resolver = account_resolver(&server, QuotaConfig::default())
        .with_verifier(Arc::new(JwtVerifier::new(SECRET)));
    let token = signer
        .sign(&Claims::new("acct-1", Duration::from_secs(300)).max_text_length(9))
        .unwrap();

    let limits = resolver
        .resolve(&CallerIdentity::default().account("acct-9", "key-9").token(token), false)
        .await
        .unwrap();
    assert_eq!(limits.source(), LimitsSource::Token);
    assert_eq!(limits.max_text_length(), 9);
}
