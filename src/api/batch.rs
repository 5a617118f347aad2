//! Fan-out planning and fan-in aggregation for batched calls.
//!
//! A caller hands the engine one target or a list of them; the plan
//! expands that into one option map per unique target (first occurrence
//! wins), and the aggregate maps each target back to its independent
//! outcome. Scalar in, scalar out.

use crate::api::transport::GatewayResponse;
use crate::error::GatewayError;
use log::warn;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// A scalar-or-list target specifier.
#[derive(Debug, Clone)]
pub enum Targets {
    One(String),
    Many(Vec<TargetSpec>),
}

/// One entry of a target list: a bare identifier, or an option map that
/// carries its own identifier plus per-target overrides.
#[derive(Debug, Clone)]
pub enum TargetSpec {
    Id(String),
    Options(Map<String, Value>),
}

impl From<&str> for Targets {
    fn from(id: &str) -> Self {
        Targets::One(id.to_string())
    }
}

impl From<String> for Targets {
    fn from(id: String) -> Self {
        Targets::One(id)
    }
}

impl From<Vec<String>> for Targets {
    fn from(ids: Vec<String>) -> Self {
        Targets::Many(ids.into_iter().map(TargetSpec::Id).collect())
    }
}

impl From<Vec<&str>> for Targets {
    fn from(ids: Vec<&str>) -> Self {
        Targets::Many(ids.iter().map(|s| TargetSpec::Id(s.to_string())).collect())
    }
}

/// Expansion result: the dispatch list plus what the aggregate needs to
/// shape its output.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    /// True when the caller passed a scalar target.
    pub only_one: bool,
    /// Unique target identifiers, dispatch order.
    pub ids: Vec<String>,
    /// One merged option map per entry of `ids`.
    pub options: Vec<Map<String, Value>>,
}

/// Expand a scalar-or-list specifier into per-target option maps keyed by
/// `key_field`, dropping duplicate targets after their first occurrence.
pub fn format_targets(
    targets: Targets,
    base: &Map<String, Value>,
    key_field: &str,
) -> Result<BatchPlan, GatewayError> {
    let (only_one, specs) = match targets {
        Targets::One(id) => (true, vec![TargetSpec::Id(id)]),
        Targets::Many(specs) => (false, specs),
    };
    let mut ids = Vec::new();
    let mut options = Vec::new();
    for spec in specs {
        let mut merged = base.clone();
        let id = match spec {
            TargetSpec::Id(id) => {
                merged.insert(key_field.to_string(), Value::String(id.clone()));
                id
            }
            TargetSpec::Options(overrides) => {
                for (k, v) in overrides {
                    merged.insert(k, v);
                }
                match merged.get(key_field).and_then(Value::as_str) {
                    Some(id) => id.to_string(),
                    None => {
                        return Err(GatewayError::Usage(format!(
                            "target options missing string field '{key_field}'"
                        )))
                    }
                }
            }
        };
        if ids.contains(&id) {
            continue;
        }
        ids.push(id);
        options.push(merged);
    }
    Ok(BatchPlan {
        only_one,
        ids,
        options,
    })
}

/// Aggregated outcome of a batched call. Each target resolved or failed
/// on its own; a connection failure on one never cancels the others.
#[derive(Debug)]
pub enum BatchResponse {
    Single(Result<GatewayResponse, GatewayError>),
    Many(HashMap<String, Result<GatewayResponse, GatewayError>>),
}

impl BatchResponse {
    /// Zip targets with their results, logging every non-200 outcome.
    pub fn collect(
        only_one: bool,
        ids: Vec<String>,
        results: Vec<Result<GatewayResponse, GatewayError>>,
    ) -> Self {
        for (id, result) in ids.iter().zip(results.iter()) {
            match result {
                Ok(response) if response.is_ok() => {}
                Ok(response) => warn!("HTTP_ERROR_{} for target {id}", response.code),
                Err(e) => warn!("request for target {id} failed: {e}"),
            }
        }
        if only_one {
            let result = results
                .into_iter()
                .next()
                .unwrap_or_else(|| Err(GatewayError::Usage("empty batch".to_string())));
            BatchResponse::Single(result)
        } else {
            BatchResponse::Many(ids.into_iter().zip(results).collect())
        }
    }

    /// The scalar result; a usage error when the call was a list.
    pub fn into_single(self) -> Result<GatewayResponse, GatewayError> {
        match self {
            BatchResponse::Single(result) => result,
            BatchResponse::Many(_) => Err(GatewayError::Usage(
                "batch call returned multiple results".to_string(),
            )),
        }
    }

    pub fn get(&self, target: &str) -> Option<&Result<GatewayResponse, GatewayError>> {
        match self {
            BatchResponse::Single(result) => Some(result),
            BatchResponse::Many(map) => map.get(target),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BatchResponse::Single(_) => 1,
            BatchResponse::Many(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, BatchResponse::Many(map) if map.is_empty())
    }
}
