//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, StatusCode};
use ipfs_gateway_proxy::safe_fetch::{FetchOptions, Fetcher};
use ipfs_gateway_proxy::{FetchedResponse, ProxyConfig, ProxyError, ProxySettings, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use url::Url;

/// Canned outcome for one gateway host
#[derive(Clone)]
pub enum Reply {
    Ok {
        status: u16,
        content_type: Option<&'static str>,
        body: &'static str,
    },
    Fail(ProxyError),
}

impl Reply {
    pub fn json(body: &'static str) -> Self {
        Reply::Ok {
            status: 200,
            content_type: Some("application/json"),
            body,
        }
    }

    pub fn html(body: &'static str) -> Self {
        Reply::Ok {
            status: 200,
            content_type: Some("text/html; charset=utf-8"),
            body,
        }
    }

    pub fn bytes(content_type: &'static str, body: &'static str) -> Self {
        Reply::Ok {
            status: 200,
            content_type: Some(content_type),
            body,
        }
    }

    pub fn connection_refused() -> Self {
        Reply::Fail(ProxyError::upstream_status(502, "Request failed: connection refused"))
    }
}

/// Fetcher answering by target hostname and recording every call
#[derive(Default)]
pub struct ScriptedFetcher {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<(String, FetchOptions)>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, host: &str, reply: Reply) -> Self {
        self.replies
            .lock()
            .unwrap()
            .insert(host.to_string(), reply);
        self
    }

    /// URLs attempted, in order
    pub fn attempted(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(url, _)| url.clone())
            .collect()
    }

    /// Options passed with each attempt, in order
    pub fn options(&self) -> Vec<FetchOptions> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, options)| options.clone())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, target: &str, options: &FetchOptions) -> Result<FetchedResponse> {
        self.calls
            .lock()
            .unwrap()
            .push((target.to_string(), options.clone()));

        let url = Url::parse(target).map_err(|e| ProxyError::BadProtocol(e.to_string()))?;
        let host = url.host_str().unwrap_or_default().to_string();
        let reply = self.replies.lock().unwrap().get(&host).cloned();

        match reply {
            Some(Reply::Ok {
                status,
                content_type,
                body,
            }) => {
                let mut headers = HeaderMap::new();
                if let Some(ct) = content_type {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static(ct));
                }
                Ok(FetchedResponse::new(
                    StatusCode::from_u16(status).unwrap(),
                    headers,
                    Bytes::from_static(body.as_bytes()),
                    url,
                ))
            }
            Some(Reply::Fail(err)) => Err(err),
            None => Err(ProxyError::upstream_status(404, "no scripted reply")),
        }
    }
}

/// Settings with the given gateway bases and defaults elsewhere
pub fn settings_with_gateways(gateways: &[&str]) -> ProxySettings {
    let mut config = ProxyConfig::default();
    config.gateways = gateways.iter().map(|g| g.to_string()).collect();
    ProxySettings::with_allowlist_override(&config, None).unwrap()
}

/// The four-gateway list used across the failover tests
pub const FOUR_GATEWAYS: [&str; 4] = [
    "https://w3s.link/ipfs/",
    "https://dweb.link/ipfs/",
    "https://gateway.pinata.cloud/ipfs/",
    "https://ipfs.io/ipfs/",
];
