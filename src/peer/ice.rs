use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::config::{Config, DEFAULT_FALLBACK_STUN};
use crate::peer::types::IceCandidate;
use crate::utils::add_ice_url_scheme;

/// Public STUN servers used when nothing else is configured.
pub static DEFAULT_STUN_SERVERS: Lazy<Vec<IceServerDescriptor>> = Lazy::new(|| {
    vec![IceServerDescriptor::stun(vec![
        DEFAULT_FALLBACK_STUN.into(),
        "stun:stun1.l.google.com:19302".into(),
    ])]
});

/// One STUN or TURN server entry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceServerDescriptor {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Urls {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Urls::deserialize(deserializer)? {
        Urls::One(url) => vec![url],
        Urls::Many(urls) => urls,
    })
}

impl IceServerDescriptor {
    pub fn stun(urls: Vec<String>) -> Self {
        Self {
            urls,
            username: None,
            credential: None,
        }
    }

    pub fn turn(urls: Vec<String>, username: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            urls,
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }

    /// Adds missing url schemes; `None` if the entry is unusable
    /// (no urls, or TURN without credentials).
    ///
    /// A bare host is taken as TURN only for a credentialed entry that no
    /// sibling url marks as STUN, and never when the host itself is `stun.*`.
    pub fn normalized(mut self) -> Option<Self> {
        let credentialed = self.username.is_some() && self.credential.is_some();
        let listed_as_stun = self
            .urls
            .iter()
            .map(|u| u.trim())
            .any(|u| u.starts_with("stun:") || u.starts_with("stuns:"));
        let infer_turn = credentialed && !listed_as_stun;
        self.urls = self
            .urls
            .iter()
            .map(|u| u.trim())
            .filter(|u| !u.is_empty())
            .map(|u| add_ice_url_scheme(u, infer_turn && !u.starts_with("stun.")))
            .collect();
        if self.urls.is_empty() {
            warn!("ICE server without urls dropped");
            return None;
        }
        if self.is_turn() && !credentialed {
            warn!(urls = ?self.urls, "TURN server without username/credential dropped");
            return None;
        }
        Some(self)
    }
}

impl From<&IceServerDescriptor> for RTCIceServer {
    fn from(desc: &IceServerDescriptor) -> Self {
        RTCIceServer {
            urls: desc.urls.clone(),
            username: desc.username.clone().unwrap_or_default(),
            credential: desc.credential.clone().unwrap_or_default(),
        }
    }
}

pub fn to_rtc_ice_servers(servers: &[IceServerDescriptor]) -> Vec<RTCIceServer> {
    servers.iter().map(RTCIceServer::from).collect()
}

/// Supplies STUN/TURN servers for a new connection. Never fails: a provider
/// that cannot reach its source degrades to public STUN.
#[async_trait]
pub trait IceConfigProvider: Send + Sync {
    async fn ice_servers(&self) -> Vec<IceServerDescriptor>;
}

/// Fixed, user-supplied server list.
#[derive(Debug, Clone)]
pub struct StaticIceProvider {
    servers: Vec<IceServerDescriptor>,
}

impl StaticIceProvider {
    /// Normalises the list, dropping unusable entries; falls back to the defaults when nothing remains.
    pub fn new(servers: Vec<IceServerDescriptor>) -> Self {
        let servers: Vec<_> = servers
            .into_iter()
            .filter_map(IceServerDescriptor::normalized)
            .collect();
        if servers.is_empty() {
            return Self::default();
        }
        info!(count = servers.len(), "using configured ICE servers");
        Self { servers }
    }
}

impl Default for StaticIceProvider {
    fn default() -> Self {
        Self {
            servers: DEFAULT_STUN_SERVERS.clone(),
        }
    }
}

#[async_trait]
impl IceConfigProvider for StaticIceProvider {
    async fn ice_servers(&self) -> Vec<IceServerDescriptor> {
        self.servers.clone()
    }
}

#[derive(Deserialize)]
struct IceServersResponse {
    #[serde(rename = "iceServers")]
    ice_servers: Vec<IceServerDescriptor>,
}

/// Fetches TURN credentials from the credential service.
#[derive(Debug, Clone)]
pub struct HttpIceProvider {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
    fallback_stun: String,
}

impl HttpIceProvider {
    pub fn new(endpoint: Url, api_key: Option<String>, timeout: Duration, fallback_stun: String) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|err| {
                warn!(error = %err, "falling back to default HTTP client");
                Client::new()
            });
        Self {
            client,
            endpoint,
            api_key,
            fallback_stun,
        }
    }

    /// `None` when no credential endpoint is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        config.ice_endpoint.clone().map(|endpoint| {
            Self::new(
                endpoint,
                config.ice_api_key.clone(),
                config.ice_timeout,
                config.fallback_stun.clone(),
            )
        })
    }

    pub fn fallback(&self) -> Vec<IceServerDescriptor> {
        vec![IceServerDescriptor::stun(vec![self.fallback_stun.clone()])]
    }

    async fn fetch(&self) -> Result<Vec<IceServerDescriptor>, reqwest::Error> {
        let mut request = self.client.get(self.endpoint.clone());
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let body: IceServersResponse = request.send().await?.error_for_status()?.json().await?;
        Ok(body.ice_servers)
    }
}

#[async_trait]
impl IceConfigProvider for HttpIceProvider {
    async fn ice_servers(&self) -> Vec<IceServerDescriptor> {
        match self.fetch().await {
            Ok(servers) => {
                let servers: Vec<_> = servers
                    .into_iter()
                    .filter_map(IceServerDescriptor::normalized)
                    .collect();
                if servers.is_empty() {
                    warn!(endpoint = %self.endpoint, "credential service returned no usable servers, using public STUN");
                    self.fallback()
                } else {
                    debug!(count = servers.len(), "ICE servers fetched");
                    servers
                }
            }
            Err(err) => {
                warn!(endpoint = %self.endpoint, error = %err, "ICE credential fetch failed, using public STUN");
                self.fallback()
            }
        }
    }
}

/// Remote candidates that arrived before the remote description was applied.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
}

impl CandidateQueue {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    /// Takes every queued candidate in arrival order.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Running host/srflx/relay tally of locally gathered candidates.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateTally {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
    pub other: usize,
}

impl CandidateTally {
    pub fn record(&mut self, candidate: &IceCandidate) {
        match candidate.candidate_type() {
            Some("host") => self.host += 1,
            Some("srflx") => self.srflx += 1,
            Some("relay") => self.relay += 1,
            _ => self.other += 1,
        }
    }

    /// Logs the tally once gathering is complete.
    pub fn report(&self) {
        info!(
            host = self.host,
            srflx = self.srflx,
            relay = self.relay,
            "candidate gathering complete"
        );
        if self.relay == 0 {
            warn!("no TURN relay candidates gathered, connection through symmetric NAT may fail");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(typ: &str) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:1 1 udp 1 10.0.0.1 5000 typ {typ}"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn parses_credential_service_response() {
        let body: IceServersResponse = serde_json::from_value(serde_json::json!({
            "iceServers": [
                {"urls": "stun:global.stun.example.org:3478"},
                {"urls": ["turn:global.turn.example.org:3478?transport=udp"], "username": "u", "credential": "c"}
            ]
        }))
        .expect("response");
        assert_eq!(body.ice_servers.len(), 2);
        assert_eq!(body.ice_servers[0].urls, ["stun:global.stun.example.org:3478"]);
        assert!(body.ice_servers[1].is_turn());
    }

    #[test]
    fn turn_without_credentials_is_dropped() {
        let turn = IceServerDescriptor::stun(vec!["turn:relay.example.org".into()]);
        assert!(turn.normalized().is_none());
        let empty = IceServerDescriptor::stun(vec!["  ".into()]);
        assert!(empty.normalized().is_none());
    }

    #[test]
    fn bare_hosts_get_a_scheme() {
        let stun = IceServerDescriptor::stun(vec!["stun.example.org:3478".into()])
            .normalized()
            .expect("stun");
        assert_eq!(stun.urls, ["stun:stun.example.org:3478"]);
        let turn = IceServerDescriptor::turn(vec!["relay.example.org:443".into()], "u", "p")
            .normalized()
            .expect("turn");
        assert_eq!(turn.urls, ["turn:relay.example.org:443"]);
    }

    #[test]
    fn credentialed_stun_hosts_stay_stun() {
        let listed = IceServerDescriptor::turn(
            vec!["stun:a.example.org:3478".into(), "b.example.org:3478".into()],
            "u",
            "p",
        )
        .normalized()
        .expect("stun");
        assert_eq!(listed.urls, ["stun:a.example.org:3478", "stun:b.example.org:3478"]);
        assert!(!listed.is_turn());

        let named = IceServerDescriptor::turn(vec!["stun.example.org:3478".into()], "u", "p")
            .normalized()
            .expect("stun");
        assert_eq!(named.urls, ["stun:stun.example.org:3478"]);
    }

    #[tokio::test]
    async fn static_provider_keeps_order_and_falls_back_when_empty() {
        let provider = StaticIceProvider::new(vec![
            IceServerDescriptor::turn(vec!["turn:a.example.org".into()], "u", "p"),
            IceServerDescriptor::stun(vec!["stun:b.example.org".into()]),
        ]);
        let servers = provider.ice_servers().await;
        assert_eq!(servers[0].urls, ["turn:a.example.org"]);
        assert_eq!(servers[1].urls, ["stun:b.example.org"]);

        let provider = StaticIceProvider::new(vec![]);
        assert_eq!(provider.ice_servers().await, *DEFAULT_STUN_SERVERS);
    }

    #[tokio::test]
    async fn unreachable_credential_service_yields_single_stun_server() {
        let endpoint = Url::parse("http://127.0.0.1:9/turn-credentials").expect("url");
        let provider = HttpIceProvider::new(
            endpoint,
            Some("key".into()),
            Duration::from_millis(500),
            DEFAULT_FALLBACK_STUN.into(),
        );
        let servers = provider.ice_servers().await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, [DEFAULT_FALLBACK_STUN]);
        assert!(servers[0].username.is_none());
        assert!(!servers[0].is_turn());
    }

    #[test]
    fn queue_drains_in_arrival_order() {
        let mut queue = CandidateQueue::default();
        queue.push(candidate("host"));
        queue.push(candidate("relay"));
        let drained = queue.drain();
        assert_eq!(drained[0].candidate_type(), Some("host"));
        assert_eq!(drained[1].candidate_type(), Some("relay"));
        assert!(queue.is_empty());
    }

    #[test]
    fn tally_counts_candidate_types() {
        let mut tally = CandidateTally::default();
        for typ in ["host", "host", "srflx", "relay", "prflx"] {
            tally.record(&candidate(typ));
        }
        assert_eq!(
            tally,
            CandidateTally {
                host: 2,
                srflx: 1,
                relay: 1,
                other: 1
            }
        );
    }

    #[test]
    fn descriptors_convert_to_rtc_servers() {
        let servers = to_rtc_ice_servers(&[IceServerDescriptor::turn(
            vec!["turn:a.example.org".into()],
            "u",
            "p",
        )]);
        assert_eq!(servers[0].username, "u");
        assert_eq!(servers[0].credential, "p");
    }
}
