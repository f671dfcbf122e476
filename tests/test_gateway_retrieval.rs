//! Integration tests for GatewayRetrieval

mod common;

use common::{settings_with_gateways, Reply, ScriptedFetcher, FOUR_GATEWAYS};
use http::header::ACCEPT;
use ipfs_gateway_proxy::gateway_retrieval::{GatewayRetrieval, RetrieveOptions};
use ipfs_gateway_proxy::{ProxyError, ProxySettings};
use std::sync::Arc;
use std::time::Duration;

fn retrieval(settings: &ProxySettings, fetcher: Arc<ScriptedFetcher>) -> GatewayRetrieval {
    GatewayRetrieval::new(Arc::new(settings.uri_policy.clone()), fetcher)
        .with_fetch_timeout(settings.fetch_timeout)
}

fn options(settings: &ProxySettings, expects_json: bool) -> RetrieveOptions {
    RetrieveOptions {
        expects_json,
        allowlist: settings.allowlist.clone(),
        max_bytes: Some(settings.max_response_bytes),
        exclude_host: None,
    }
}

#[tokio::test]
async fn test_manifest_failover_scenario() {
    let settings = settings_with_gateways(&FOUR_GATEWAYS);
    let fetcher = Arc::new(
        ScriptedFetcher::new()
            .reply("w3s.link", Reply::connection_refused())
            .reply("dweb.link", Reply::connection_refused())
            .reply("gateway.pinata.cloud", Reply::html("<html>gateway error</html>"))
            .reply("ipfs.io", Reply::json("{\"a\":1}")),
    );

    let locator = settings
        .uri_policy
        .parse_locator("ipfs://bafybeigexample/manifest.json")
        .unwrap();
    assert!(locator.expects_json());

    let served = retrieval(&settings, Arc::clone(&fetcher))
        .retrieve(&locator, &options(&settings, true))
        .await
        .unwrap();

    assert_eq!(served.attempts, 4);
    assert_eq!(served.response.status.as_u16(), 200);
    assert_eq!(&served.response.body[..], b"{\"a\":1}");
    assert_eq!(served.candidate.host(), Some("ipfs.io"));
    assert_eq!(
        fetcher.attempted(),
        vec![
            "https://w3s.link/ipfs/bafybeigexample/manifest.json",
            "https://dweb.link/ipfs/bafybeigexample/manifest.json",
            "https://gateway.pinata.cloud/ipfs/bafybeigexample/manifest.json",
            "https://ipfs.io/ipfs/bafybeigexample/manifest.json",
        ]
    );

    // every attempt asked for JSON under the configured bounds
    for opts in fetcher.options() {
        assert_eq!(opts.headers.get(ACCEPT).unwrap(), "application/json");
        assert_eq!(opts.max_bytes, Some(2 * 1024 * 1024));
        assert_eq!(opts.timeout, Duration::from_secs(12));
    }
}

#[tokio::test]
async fn test_first_success_short_circuits() {
    let settings = settings_with_gateways(&FOUR_GATEWAYS);
    let fetcher = Arc::new(
        ScriptedFetcher::new()
            .reply("w3s.link", Reply::bytes("image/png", "\u{89}PNG"))
            .reply("dweb.link", Reply::bytes("image/png", "never")),
    );

    let locator = settings.uri_policy.parse_locator("ipfs://bafy/cube.png").unwrap();
    let served = retrieval(&settings, Arc::clone(&fetcher))
        .retrieve(&locator, &options(&settings, false))
        .await
        .unwrap();

    assert_eq!(served.attempts, 1);
    assert_eq!(fetcher.call_count(), 1);
    assert!(fetcher.options()[0].headers.get(ACCEPT).is_none());
}

#[tokio::test]
async fn test_html_accepted_when_json_not_expected() {
    let settings = settings_with_gateways(&FOUR_GATEWAYS);
    let fetcher = Arc::new(ScriptedFetcher::new().reply("w3s.link", Reply::html("<p>hi</p>")));

    let locator = settings.uri_policy.parse_locator("ipfs://bafy/index.html").unwrap();
    let served = retrieval(&settings, Arc::clone(&fetcher))
        .retrieve(&locator, &options(&settings, false))
        .await
        .unwrap();
    assert_eq!(&served.response.body[..], b"<p>hi</p>");
}

#[tokio::test]
async fn test_non_json_body_is_soft_failure() {
    let settings = settings_with_gateways(&FOUR_GATEWAYS);
    let fetcher = Arc::new(
        ScriptedFetcher::new()
            .reply("w3s.link", Reply::bytes("text/plain", "gateway busy"))
            .reply("dweb.link", Reply::bytes("text/plain", "  [1, 2, 3]")),
    );

    let locator = settings.uri_policy.parse_locator("ipfs://bafy/list.json").unwrap();
    let served = retrieval(&settings, Arc::clone(&fetcher))
        .retrieve(&locator, &options(&settings, true))
        .await
        .unwrap();
    assert_eq!(served.attempts, 2);
    assert_eq!(served.candidate.host(), Some("dweb.link"));
}

#[tokio::test]
async fn test_all_gateways_fail() {
    let settings = settings_with_gateways(&FOUR_GATEWAYS);
    let fetcher = Arc::new(
        ScriptedFetcher::new()
            .reply("w3s.link", Reply::Fail(ProxyError::Timeout { timeout_ms: 12_000 }))
            .reply("dweb.link", Reply::Fail(ProxyError::TooLarge { limit: 10 }))
            .reply("gateway.pinata.cloud", Reply::html("<html></html>"))
            .reply("ipfs.io", Reply::Fail(ProxyError::DisallowedHost("ipfs.io".into()))),
    );

    let locator = settings.uri_policy.parse_locator("ipfs://bafy/a.json").unwrap();
    let err = retrieval(&settings, Arc::clone(&fetcher))
        .retrieve(&locator, &options(&settings, true))
        .await
        .unwrap_err();

    assert_eq!(err, ProxyError::AllGatewaysFailed { attempts: 4 });
    assert_eq!(err.to_http_status(), 502);
    assert_eq!(fetcher.call_count(), 4);
}

#[tokio::test]
async fn test_excluded_host_never_attempted() {
    let settings = settings_with_gateways(&FOUR_GATEWAYS);
    let fetcher = Arc::new(
        ScriptedFetcher::new()
            .reply("w3s.link", Reply::json("{\"self\":true}"))
            .reply("dweb.link", Reply::json("{\"ok\":true}")),
    );

    let locator = settings.uri_policy.parse_locator("ipfs://bafy/a.json").unwrap();
    let mut opts = options(&settings, true);
    opts.exclude_host = Some("W3S.link".to_string());

    let served = retrieval(&settings, Arc::clone(&fetcher))
        .retrieve(&locator, &opts)
        .await
        .unwrap();

    assert_eq!(served.candidate.host(), Some("dweb.link"));
    assert!(fetcher.attempted().iter().all(|url| !url.contains("w3s.link")));
}

#[tokio::test]
async fn test_query_preserved_on_every_candidate() {
    let settings = settings_with_gateways(&FOUR_GATEWAYS);
    let fetcher = Arc::new(ScriptedFetcher::new());

    let locator = settings
        .uri_policy
        .parse_locator("ipfs://bafy/img.png?filename=cube.png")
        .unwrap();
    let _ = retrieval(&settings, Arc::clone(&fetcher))
        .retrieve(&locator, &options(&settings, false))
        .await;

    let attempted = fetcher.attempted();
    assert_eq!(attempted.len(), 4);
    assert!(attempted
        .iter()
        .all(|url| url.ends_with("/ipfs/bafy/img.png?filename=cube.png")));
}

#[tokio::test]
async fn test_deadline_clamps_attempt_timeout() {
    let settings = settings_with_gateways(&FOUR_GATEWAYS);
    let fetcher = Arc::new(ScriptedFetcher::new().reply("w3s.link", Reply::json("{}")));

    let locator = settings.uri_policy.parse_locator("ipfs://bafy/a.json").unwrap();
    let served = retrieval(&settings, Arc::clone(&fetcher))
        .with_deadline(Some(Duration::from_secs(5)))
        .retrieve(&locator, &options(&settings, true))
        .await
        .unwrap();

    assert_eq!(served.attempts, 1);
    let timeout = fetcher.options()[0].timeout;
    assert!(timeout <= Duration::from_secs(5));
    assert!(timeout > Duration::from_secs(4));
}
