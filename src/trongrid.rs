//! TronGrid endpoint helpers over the gateway engine.
//!
//! Thin request builders for the TronGrid HTTP API, plus the
//! fingerprint-pagination mode used when polling an address for a known
//! transaction: pages are re-requested with the server's cursor until the
//! target hash shows up (or the page bound is hit), accumulating shaped
//! transfer rows across pages.

use crate::api::batch::{format_targets, BatchResponse, Targets};
use crate::api::transport::{GatewayResponse, RequestOptions};
use crate::client::GatewayClient;
use crate::config::Config;
use crate::error::GatewayError;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Public TronGrid mainnet endpoint.
pub const MAINNET_HOST: &str = "https://api.trongrid.io";

/// Follow-up page bound for the check-hash polling mode.
const MAX_FOLLOW_PAGES: u32 = 10;

/// Query options for the TRC20 transaction listing.
#[derive(Debug, Clone, Default)]
pub struct Trc20Query {
    pub only_confirmed: Option<bool>,
    pub only_unconfirmed: Option<bool>,
    /// Server default 20, maximum 200.
    pub limit: Option<u32>,
    pub min_timestamp: Option<i64>,
    pub max_timestamp: Option<i64>,
    /// Filter to one token contract, e.g. the USDT contract.
    pub contract_address: Option<String>,
    pub only_to: Option<bool>,
    pub only_from: Option<bool>,
    pub fingerprint: Option<String>,

    // Shaping options, never sent to the server.
    /// Produce a shaped `transfers` list alongside the raw rows.
    pub format: bool,
    /// Follow pages until `last_hash` is observed.
    pub check_hash: bool,
    /// The transaction id that marks "caught up" when checking hashes.
    pub last_hash: Option<String>,
}

impl Trc20Query {
    /// Request parameters as a generic option map. Shaping options stay
    /// local to the client.
    fn params(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(v) = self.only_confirmed {
            map.insert("only_confirmed".to_string(), json!(v));
        }
        if let Some(v) = self.only_unconfirmed {
            map.insert("only_unconfirmed".to_string(), json!(v));
        }
        if let Some(v) = self.limit {
            map.insert("limit".to_string(), json!(v));
        }
        if let Some(v) = self.min_timestamp {
            map.insert("min_timestamp".to_string(), json!(v));
        }
        if let Some(v) = self.max_timestamp {
            map.insert("max_timestamp".to_string(), json!(v));
        }
        if let Some(v) = &self.contract_address {
            map.insert("contract_address".to_string(), json!(v));
        }
        if let Some(v) = self.only_to {
            map.insert("only_to".to_string(), json!(v));
        }
        if let Some(v) = self.only_from {
            map.insert("only_from".to_string(), json!(v));
        }
        if let Some(v) = &self.fingerprint {
            map.insert("fingerprint".to_string(), json!(v));
        }
        map
    }
}

/// TronGrid API client.
pub struct TronGridClient {
    client: GatewayClient,
}

impl TronGridClient {
    pub fn new(config: Config) -> Result<Self, GatewayError> {
        Ok(TronGridClient {
            client: GatewayClient::new(config)?,
        })
    }

    /// Client for the public mainnet gateway.
    pub fn mainnet(keys: Vec<String>) -> Result<Self, GatewayError> {
        Self::new(Config::new(MAINNET_HOST).with_keys(keys))
    }

    /// Wrap an already-assembled engine (tests inject transports here).
    pub fn from_client(client: GatewayClient) -> Self {
        TronGridClient { client }
    }

    pub fn client(&self) -> &GatewayClient {
        &self.client
    }

    /// Suppress key attachment on first attempts; the 403 healing path
    /// still attaches one on demand.
    pub fn without_key(&self, without: bool) -> &Self {
        self.client.without_key(without);
        self
    }

    /// Contract metadata for accounts that are contract addresses.
    pub async fn get_contract(
        &self,
        targets: impl Into<Targets>,
        max_retry: u32,
    ) -> Result<BatchResponse, GatewayError> {
        let plan = format_targets(targets.into(), &Map::new(), "value")?;
        let batch = plan
            .ids
            .iter()
            .map(|addr| {
                RequestOptions::post(
                    "/wallet/getcontractinfo",
                    json!({ "value": addr, "visible": true }).to_string(),
                )
            })
            .collect();
        Ok(self.client.call(plan.only_one, plan.ids, batch, max_retry).await)
    }

    /// v1 accounts lookup: TRX balance plus all TRC20 balances.
    pub async fn get_accounts_v1(
        &self,
        targets: impl Into<Targets>,
        max_retry: u32,
    ) -> Result<BatchResponse, GatewayError> {
        let plan = format_targets(targets.into(), &Map::new(), "address")?;
        let batch = plan
            .ids
            .iter()
            .map(|addr| RequestOptions::get(format!("/v1/accounts/{addr}")))
            .collect();
        Ok(self.client.call(plan.only_one, plan.ids, batch, max_retry).await)
    }

    /// Bandwidth/energy resources for an address.
    pub async fn get_account_resource(
        &self,
        targets: impl Into<Targets>,
        max_retry: u32,
    ) -> Result<BatchResponse, GatewayError> {
        let plan = format_targets(targets.into(), &Map::new(), "address")?;
        let batch = plan
            .ids
            .iter()
            .map(|addr| {
                RequestOptions::post(
                    "/wallet/getaccountresource",
                    json!({ "address": addr, "visible": true }).to_string(),
                )
            })
            .collect();
        Ok(self.client.call(plan.only_one, plan.ids, batch, max_retry).await)
    }

    /// Confirmed transaction info by transaction id.
    pub async fn get_transaction_info(
        &self,
        targets: impl Into<Targets>,
        max_retry: u32,
    ) -> Result<BatchResponse, GatewayError> {
        let plan = format_targets(targets.into(), &Map::new(), "value")?;
        let batch = plan
            .ids
            .iter()
            .map(|txid| {
                RequestOptions::post(
                    "/walletsolidity/gettransactioninfobyid",
                    json!({ "value": txid }).to_string(),
                )
            })
            .collect();
        Ok(self.client.call(plan.only_one, plan.ids, batch, max_retry).await)
    }

    /// TRC20/TRC721 transaction listing, optionally shaped and optionally
    /// following the server's fingerprint cursor until `last_hash` is
    /// found (deposit-polling mode).
    pub async fn get_trc20_transactions(
        &self,
        targets: impl Into<Targets>,
        query: &Trc20Query,
        max_retry: u32,
    ) -> Result<BatchResponse, GatewayError> {
        let plan = format_targets(targets.into(), &query.params(), "address")?;
        let only_one = plan.only_one;
        let all_ids = plan.ids.clone();
        let with_contract = query.contract_address.is_some();

        // Initial page per unique address.
        let base_paths: Vec<String> = plan
            .ids
            .iter()
            .zip(plan.options.iter())
            .map(|(addr, options)| trc20_path(addr, options))
            .collect();

        let mut follow: HashMap<String, FollowState> = HashMap::new();
        if query.check_hash {
            for (addr, path) in all_ids.iter().zip(base_paths.iter()) {
                follow.insert(
                    addr.clone(),
                    FollowState {
                        page: 0,
                        base_path: path.clone(),
                    },
                );
            }
        }

        let mut results: HashMap<String, Result<GatewayResponse, GatewayError>> = HashMap::new();
        let mut accumulated: HashMap<String, (Vec<Value>, Vec<Value>)> = HashMap::new();
        let mut pending: Vec<(String, String)> = all_ids
            .iter()
            .cloned()
            .zip(base_paths.into_iter())
            .collect();

        while !pending.is_empty() {
            let (addrs, paths): (Vec<String>, Vec<String>) = pending.drain(..).unzip();
            let batch = paths.iter().map(|p| RequestOptions::get(p.clone())).collect();
            let responses = self.client.send_batch(batch, max_retry).await;

            for (addr, result) in addrs.into_iter().zip(responses) {
                let mut response = match result {
                    Ok(response) => response,
                    Err(e) => {
                        results.insert(addr, Err(e));
                        continue;
                    }
                };
                let rows = (response.code == 200 && query.format)
                    .then(|| response.json().and_then(|v| v.get("data")).and_then(Value::as_array).cloned())
                    .flatten();
                let Some(rows) = rows else {
                    results.insert(addr, Ok(response));
                    continue;
                };

                let (mut page_rows, mut page_items, found) =
                    shape_transfers(&rows, &addr, with_contract, query);

                // Not caught up: chase the cursor, bounded.
                if !found {
                    if let Some(state) = follow.get_mut(&addr) {
                        let fingerprint = response
                            .json()
                            .and_then(|v| v.pointer("/meta/fingerprint"))
                            .and_then(Value::as_str)
                            .map(String::from);
                        if let (true, Some(fingerprint)) = (state.page < MAX_FOLLOW_PAGES, fingerprint) {
                            state.page += 1;
                            let sep = if state.base_path.contains('?') { '&' } else { '?' };
                            pending.push((
                                addr.clone(),
                                format!("{}{}fingerprint={}", state.base_path, sep, fingerprint),
                            ));
                        }
                    }
                }

                let (acc_rows, acc_items) = accumulated.entry(addr.clone()).or_default();
                acc_rows.append(&mut page_rows);
                acc_items.append(&mut page_items);
                if let Some(obj) = response.body.as_json_mut().and_then(Value::as_object_mut) {
                    obj.insert("data".to_string(), Value::Array(acc_rows.clone()));
                    obj.insert("transfers".to_string(), Value::Array(acc_items.clone()));
                }
                results.insert(addr, Ok(response));
            }
        }

        let ordered = all_ids
            .iter()
            .map(|addr| {
                results.remove(addr).unwrap_or_else(|| {
                    Err(GatewayError::Usage(format!("no result for target {addr}")))
                })
            })
            .collect();
        Ok(BatchResponse::collect(only_one, all_ids, ordered))
    }
}

#[derive(Debug)]
struct FollowState {
    page: u32,
    base_path: String,
}

/// `/v1/accounts/{addr}/transactions/trc20` with the remaining options as
/// the query string.
fn trc20_path(addr: &str, options: &Map<String, Value>) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in options {
        if name == "address" {
            continue;
        }
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        query.append_pair(name, &text);
    }
    let query = query.finish();
    if query.is_empty() {
        format!("/v1/accounts/{addr}/transactions/trc20")
    } else {
        format!("/v1/accounts/{addr}/transactions/trc20?{query}")
    }
}

/// Shape raw rows into transfer items, stopping at `last_hash` when the
/// check-hash mode is on. Returns the retained raw rows, the shaped
/// items, and whether the address is caught up.
fn shape_transfers(
    rows: &[Value],
    addr: &str,
    with_contract: bool,
    query: &Trc20Query,
) -> (Vec<Value>, Vec<Value>, bool) {
    let mut raw = Vec::new();
    let mut items = Vec::new();
    let mut found = !query.check_hash;
    for row in rows {
        if row.get("type").and_then(Value::as_str) != Some("Transfer") {
            continue;
        }
        let to = row.get("to").and_then(Value::as_str).unwrap_or_default();
        let incoming = to == addr;
        let value = row
            .get("value")
            .map(|v| match v {
                Value::String(s) => s.parse::<f64>().unwrap_or(0.0),
                Value::Number(n) => n.as_f64().unwrap_or(0.0),
                _ => 0.0,
            })
            .unwrap_or(0.0);
        let id = row
            .get("transaction_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut item = json!({
            "id": id,
            "time": row.get("block_timestamp").cloned().unwrap_or(Value::Null),
            "trader": if incoming { row.get("from") } else { row.get("to") }
                .cloned()
                .unwrap_or(Value::Null),
            "amount": if incoming { value } else { -value },
            "decimals": row.pointer("/token_info/decimals").cloned().unwrap_or(Value::Null),
        });
        if !with_contract {
            item["symbol"] = row.pointer("/token_info/symbol").cloned().unwrap_or(Value::Null);
        }

        let mut add = true;
        if query.check_hash {
            match &query.last_hash {
                None => found = true,
                Some(last) if *last == id => {
                    add = false;
                    found = true;
                }
                Some(_) => {}
            }
        }
        if add {
            items.push(item);
            raw.push(row.clone());
        }
        if found {
            break;
        }
    }
    (raw, items, found)
}
