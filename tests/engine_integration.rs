use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use http::{HeaderMap, HeaderName};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use gridline::api::transport::{AttemptOutcome, RequestOptions, Transport};
use gridline::api::FreezeVerdict;
use gridline::client::GatewayClient;
use gridline::config::Config;
use gridline::error::GatewayError;
use gridline::trongrid::{Trc20Query, TronGridClient};

const KEY_HEADER: HeaderName = HeaderName::from_static("tron-pro-api-key");

/// Transport that serves scripted outcomes per request path and records
/// every attempt it saw (path plus attached key, in order).
struct RouteTransport {
    routes: Mutex<HashMap<String, VecDeque<AttemptOutcome>>>,
    log: Mutex<Vec<(String, Option<String>)>>,
}

impl RouteTransport {
    fn new() -> Arc<Self> {
        Arc::new(RouteTransport {
            routes: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        })
    }

    fn route(&self, path: &str, outcomes: Vec<AttemptOutcome>) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), outcomes.into());
    }

    fn attempts(&self) -> Vec<(String, Option<String>)> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RouteTransport {
    async fn send(
        &self,
        options: &RequestOptions,
        _timing: bool,
    ) -> Result<AttemptOutcome, GatewayError> {
        self.log
            .lock()
            .unwrap()
            .push((options.path.clone(), options.header_str(&KEY_HEADER)));
        let outcome = self
            .routes
            .lock()
            .unwrap()
            .get_mut(&options.path)
            .and_then(VecDeque::pop_front);
        Ok(outcome.unwrap_or_else(|| ok_json(json!({ "unrouted": options.path.clone() }))))
    }
}

fn ok_json(body: Value) -> AttemptOutcome {
    AttemptOutcome {
        code: 200,
        headers: HeaderMap::new(),
        body: body.to_string(),
        phase: None,
    }
}

fn status(code: i32, body: &str) -> AttemptOutcome {
    AttemptOutcome {
        code,
        headers: HeaderMap::new(),
        body: body.to_string(),
        phase: None,
    }
}

fn test_config(keys: &[&str]) -> Config {
    let _ = env_logger::builder().is_test(true).try_init();
    Config::new("http://127.0.0.1:1").with_keys(keys.iter().map(|k| k.to_string()).collect())
}

fn transfer_row(id: &str, to: &str, from: &str, value: &str) -> Value {
    json!({
        "type": "Transfer",
        "transaction_id": id,
        "block_timestamp": 1_700_000_000_000_i64,
        "to": to,
        "from": from,
        "value": value,
        "token_info": { "decimals": 6, "symbol": "USDT" },
    })
}

#[tokio::test]
async fn test_trc20_pagination_accumulates_until_known_hash() {
    let transport = RouteTransport::new();
    let addr = "Tdeposit";
    let base = format!("/v1/accounts/{addr}/transactions/trc20");
    transport.route(
        &base,
        vec![ok_json(json!({
            "data": [transfer_row("new2", addr, "a", "500")],
            "meta": { "fingerprint": "fp1" },
        }))],
    );
    transport.route(
        &format!("{base}?fingerprint=fp1"),
        vec![ok_json(json!({
            "data": [
                transfer_row("new1", addr, "b", "300"),
                transfer_row("seen", addr, "c", "100"),
            ],
            "meta": { "fingerprint": "fp2" },
        }))],
    );

    let client =
        GatewayClient::with_transport(test_config(&["k1"]), transport.clone()).unwrap();
    let grid = TronGridClient::from_client(client);
    let query = Trc20Query {
        format: true,
        check_hash: true,
        last_hash: Some("seen".to_string()),
        ..Default::default()
    };
    let response = grid
        .get_trc20_transactions(addr, &query, 3)
        .await
        .unwrap()
        .into_single()
        .unwrap();

    // Two pages were fetched, the second through the server cursor.
    let paths: Vec<String> = transport.attempts().into_iter().map(|(p, _)| p).collect();
    assert_eq!(paths, vec![base.clone(), format!("{base}?fingerprint=fp1")]);

    // Everything newer than the known hash, merged across pages, newest first.
    let transfers = response.json().unwrap()["transfers"].as_array().unwrap().clone();
    let ids: Vec<&str> = transfers.iter().map(|t| t["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["new2", "new1"]);
    assert_eq!(transfers[0]["amount"], json!(500.0));
    assert_eq!(response.json().unwrap()["data"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_trc20_pagination_stops_at_page_bound_without_match() {
    let transport = RouteTransport::new();
    let addr = "Tquiet";
    let base = format!("/v1/accounts/{addr}/transactions/trc20");
    // Every page returns one unknown transfer and another cursor.
    transport.route(
        &base,
        vec![ok_json(json!({
            "data": [transfer_row("p0", addr, "x", "1")],
            "meta": { "fingerprint": "fp0" },
        }))],
    );
    for page in 0..15 {
        transport.route(
            &format!("{base}?fingerprint=fp{page}"),
            vec![ok_json(json!({
                "data": [transfer_row(&format!("p{}", page + 1), addr, "x", "1")],
                "meta": { "fingerprint": format!("fp{}", page + 1) },
            }))],
        );
    }

    let client =
        GatewayClient::with_transport(test_config(&["k1"]), transport.clone()).unwrap();
    let grid = TronGridClient::from_client(client);
    let query = Trc20Query {
        format: true,
        check_hash: true,
        last_hash: Some("never-seen".to_string()),
        ..Default::default()
    };
    let response = grid
        .get_trc20_transactions(addr, &query, 3)
        .await
        .unwrap()
        .into_single()
        .unwrap();

    // First page plus ten follow-ups, no more.
    assert_eq!(transport.attempts().len(), 11);
    let transfers = response.json().unwrap()["transfers"].as_array().unwrap().len();
    assert_eq!(transfers, 11);
}

#[tokio::test]
async fn test_forbidden_rotates_key_and_freezes_old_one() {
    let transport = RouteTransport::new();
    transport.route(
        "/wallet/getaccountresource",
        vec![
            status(403, r#"{"Error":"exceeds the frequency limit"}"#),
            ok_json(json!({ "freeNetLimit": 600 })),
        ],
    );

    let client = GatewayClient::with_transport(test_config(&["k1", "k2"]), transport.clone())
        .unwrap()
        .with_classifier(Arc::new(|_body| FreezeVerdict::FreezeDefault));
    let grid = TronGridClient::from_client(client);

    let response = grid
        .get_account_resource("Taddr", 3)
        .await
        .unwrap()
        .into_single()
        .unwrap();
    assert_eq!(response.code, 200);

    // Second attempt carried a different key than the first.
    let keys: Vec<Option<String>> =
        transport.attempts().into_iter().map(|(_, k)| k).collect();
    assert_eq!(keys.len(), 2);
    assert_ne!(keys[0], keys[1]);

    let stats = grid.client().pool().stats().await;
    assert_eq!(stats.frozen, 1);
    assert_eq!(stats.in_use, 0);
}

#[tokio::test]
async fn test_without_key_heals_forbidden_with_credentialed_retry() {
    let transport = RouteTransport::new();
    transport.route(
        "/v1/accounts/Topen",
        vec![status(403, "forbidden"), ok_json(json!({ "data": [] }))],
    );

    let client =
        GatewayClient::with_transport(test_config(&["k1"]), transport.clone()).unwrap();
    let grid = TronGridClient::from_client(client);
    grid.without_key(true);

    let response = grid
        .get_accounts_v1("Topen", 3)
        .await
        .unwrap()
        .into_single()
        .unwrap();
    assert_eq!(response.code, 200);

    let attempts = transport.attempts();
    assert_eq!(attempts.len(), 2);
    assert!(attempts[0].1.is_none());
    assert_eq!(attempts[1].1.as_deref(), Some("k1"));
}

#[tokio::test]
async fn test_batch_deduplicates_and_keys_results_by_target() {
    let transport = RouteTransport::new();
    transport.route("/v1/accounts/Ta", vec![ok_json(json!({ "who": "a" }))]);
    transport.route("/v1/accounts/Tb", vec![ok_json(json!({ "who": "b" }))]);

    let client =
        GatewayClient::with_transport(test_config(&["k1"]), transport.clone()).unwrap();
    let grid = TronGridClient::from_client(client);

    let batch = grid
        .get_accounts_v1(vec!["Ta", "Tb", "Ta"], 3)
        .await
        .unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(transport.attempts().len(), 2);

    let a = batch.get("Ta").unwrap().as_ref().unwrap();
    assert_eq!(a.json().unwrap()["who"], json!("a"));
    let b = batch.get("Tb").unwrap().as_ref().unwrap();
    assert_eq!(b.json().unwrap()["who"], json!("b"));
}

#[tokio::test]
async fn test_transient_failure_retries_and_releases_keys() {
    let transport = RouteTransport::new();
    transport.route(
        "/wallet/getcontractinfo",
        vec![
            status(-1, "stream reset"),
            status(502, "bad gateway"),
            ok_json(json!({ "name": "Tether" })),
        ],
    );

    let client =
        GatewayClient::with_transport(test_config(&["k1"]), transport.clone()).unwrap();
    let grid = TronGridClient::from_client(client);

    let response = grid
        .get_contract("Tusdt", 5)
        .await
        .unwrap()
        .into_single()
        .unwrap();
    assert_eq!(response.code, 200);
    assert_eq!(transport.attempts().len(), 3);

    // The key came back to the pool once the call settled.
    let stats = grid.client().pool().stats().await;
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.active, 1);
}
