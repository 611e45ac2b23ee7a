//! Catalog client: periodic advertisement of manager status and
//! discovery of worker factories.
//!
//! The manager pushes a JSON status object to each configured catalog
//! host. When the full object exceeds the datagram-sized limit the lean
//! variant is pushed instead, keeping only the fields factories and the
//! status tools need. Factory discovery queries the same hosts and feeds
//! the factory table.
use crate::error::SwarmResult;
use serde_json::Value;
use std::time::Duration;

/// Status objects larger than this advertise the lean variant.
pub const ADVERT_PAYLOAD_MAX: usize = 65536;

/// One factory record from a catalog query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryRecord {
    pub name: String,
    pub max_workers: Option<i64>,
}

/// HTTP client for one or more catalog hosts.
#[derive(Clone)]
pub struct CatalogClient {
    client: reqwest::Client,
    hosts: Vec<String>,
}

impl CatalogClient {
    /// `hosts` is a comma-separated list of `host:port` entries.
    pub fn new(hosts: &str) -> SwarmResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        let hosts = hosts
            .split(',')
            .map(|h| h.trim())
            .filter(|h| !h.is_empty())
            .map(|h| {
                if h.starts_with("http://") || h.starts_with("https://") {
                    h.to_string()
                } else {
                    format!("http://{}", h)
                }
            })
            .collect();
        Ok(CatalogClient { client, hosts })
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Push the status object to every catalog host, falling back to the
    /// lean variant when the full one is oversized. Failures are logged
    /// and do not disturb the queue.
    pub async fn advertise(&self, full: &Value, lean: &Value) {
        let full_body = full.to_string();
        let body = if full_body.len() > ADVERT_PAYLOAD_MAX {
            lean.to_string()
        } else {
            full_body
        };

        for host in &self.hosts {
            let url = format!("{}/update", host);
            match self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .body(body.clone())
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    log::debug!("advertised manager status to {}", host)
                }
                Ok(resp) => log::warn!("catalog {} rejected update: {}", host, resp.status()),
                Err(e) => log::warn!("failed to advertise to catalog {}: {}", host, e),
            }
        }
    }

    /// Query the catalog hosts for the named factories. The first host
    /// that answers wins.
    pub async fn query_factories(&self, names: &[String]) -> Vec<FactoryRecord> {
        if names.is_empty() {
            return Vec::new();
        }

        for host in &self.hosts {
            let url = format!("{}/query", host);
            let resp = self
                .client
                .get(&url)
                .query(&[("type", "swarm_factory"), ("names", &names.join(","))])
                .send()
                .await;
            let resp = match resp {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    log::debug!("catalog {} query failed: {}", host, r.status());
                    continue;
                }
                Err(e) => {
                    log::debug!("catalog {} unreachable: {}", host, e);
                    continue;
                }
            };
            match resp.json::<Value>().await {
                Ok(Value::Array(items)) => {
                    return items
                        .iter()
                        .filter_map(|j| {
                            let name = j.get("factory_name")?.as_str()?.to_string();
                            let max_workers = j.get("max_workers").and_then(Value::as_i64);
                            Some(FactoryRecord { name, max_workers })
                        })
                        .collect();
                }
                Ok(other) => {
                    log::debug!("catalog {} returned non-array: {}", host, other);
                }
                Err(e) => {
                    log::debug!("catalog {} returned invalid JSON: {}", host, e);
                }
            }
        }
        Vec::new()
    }
}
