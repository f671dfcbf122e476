// Property: ordered failover
//
// When the first N gateways fail (in any per-attempt way) and gateway N+1
// succeeds, retrieval returns gateway N+1's response after exactly N+1
// attempts, and no gateway after it is contacted.

mod common;

use common::{settings_with_gateways, Reply, ScriptedFetcher};
use ipfs_gateway_proxy::gateway_retrieval::{GatewayRetrieval, RetrieveOptions};
use ipfs_gateway_proxy::ProxyError;
use proptest::prelude::*;
use std::sync::Arc;

const GATEWAYS: [&str; 6] = [
    "https://gw0.example/ipfs/",
    "https://gw1.example/ipfs/",
    "https://gw2.example/ipfs/",
    "https://gw3.example/ipfs/",
    "https://gw4.example/ipfs/",
    "https://gw5.example/ipfs/",
];

fn failure(kind: u8) -> Reply {
    match kind % 6 {
        0 => Reply::connection_refused(),
        1 => Reply::Fail(ProxyError::upstream_status(500, "Upstream error (500)")),
        2 => Reply::Fail(ProxyError::Timeout { timeout_ms: 12_000 }),
        3 => Reply::Fail(ProxyError::TooLarge { limit: 2 * 1024 * 1024 }),
        4 => Reply::Fail(ProxyError::BlockedHost("10.0.0.1".to_string())),
        _ => Reply::html("<html>not found</html>"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_first_success_after_n_failures(
        failures in proptest::collection::vec(any::<u8>(), 0..6),
    ) {
        let n = failures.len();
        let settings = settings_with_gateways(&GATEWAYS);

        let mut fetcher = ScriptedFetcher::new();
        for (i, kind) in failures.iter().enumerate() {
            fetcher = fetcher.reply(&format!("gw{}.example", i), failure(*kind));
        }
        fetcher = fetcher.reply(&format!("gw{}.example", n), Reply::json("{\"winner\":true}"));
        for i in (n + 1)..GATEWAYS.len() {
            fetcher = fetcher.reply(&format!("gw{}.example", i), Reply::json("{\"late\":true}"));
        }
        let fetcher = Arc::new(fetcher);

        let retrieval = GatewayRetrieval::new(
            Arc::new(settings.uri_policy.clone()),
            Arc::clone(&fetcher) as Arc<dyn ipfs_gateway_proxy::Fetcher>,
        );
        let locator = settings.uri_policy.parse_locator("ipfs://bafy/manifest.json").unwrap();
        let options = RetrieveOptions {
            expects_json: true,
            allowlist: settings.allowlist.clone(),
            max_bytes: Some(settings.max_response_bytes),
            exclude_host: None,
        };

        let served = tokio_test::block_on(retrieval.retrieve(&locator, &options)).unwrap();

        prop_assert_eq!(served.attempts, n + 1);
        prop_assert_eq!(&served.response.body[..], b"{\"winner\":true}");
        prop_assert_eq!(fetcher.call_count(), n + 1);

        let expected_host = format!("gw{}.example", n);
        prop_assert_eq!(served.candidate.host(), Some(expected_host.as_str()));
    }

    #[test]
    fn prop_exhaustion_counts_every_gateway(
        failures in proptest::collection::vec(any::<u8>(), 6),
    ) {
        let settings = settings_with_gateways(&GATEWAYS);
        let mut fetcher = ScriptedFetcher::new();
        for (i, kind) in failures.iter().enumerate() {
            fetcher = fetcher.reply(&format!("gw{}.example", i), failure(*kind));
        }
        let fetcher = Arc::new(fetcher);

        let retrieval = GatewayRetrieval::new(
            Arc::new(settings.uri_policy.clone()),
            Arc::clone(&fetcher) as Arc<dyn ipfs_gateway_proxy::Fetcher>,
        );
        let locator = settings.uri_policy.parse_locator("ipfs://bafy/a.json").unwrap();
        let options = RetrieveOptions {
            expects_json: true,
            allowlist: settings.allowlist.clone(),
            max_bytes: Some(settings.max_response_bytes),
            exclude_host: None,
        };

        let err = tokio_test::block_on(retrieval.retrieve(&locator, &options)).unwrap_err();
        prop_assert_eq!(err, ProxyError::AllGatewaysFailed { attempts: 6 });
        prop_assert_eq!(fetcher.call_count(), 6);
    }
}
