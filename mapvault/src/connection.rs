//! Per-worker keep-alive HTTP connections, one per host, recycled after a
//! request budget or an IO error.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONNECTION};
use reqwest::Client;

/// Maximum requests served on one connection before it is discarded.
pub const REQUESTS_PER_CONN: u32 = 50;

/// Default `User-Agent` for tile-server requests.
pub const DEFAULT_USER_AGENT: &str = "mapvault/0.1";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One HTTP GET outcome. `status` is None when the transport failed
/// before a status line arrived.
#[derive(Debug, Clone)]
pub struct HttpOutcome {
    pub status: Option<u16>,
    pub data: Option<Vec<u8>>,
    pub error: Option<String>,
}

impl HttpOutcome {
    fn failed(message: String) -> Self {
        Self {
            status: None,
            data: None,
            error: Some(message),
        }
    }
}

struct HostEntry {
    client: Client,
    requests: u32,
    errored: bool,
}

/// Keep-alive connection per host. Owned by a single download worker for
/// its lifetime; dropped entries close their connections.
pub struct HostConnections {
    entries: HashMap<String, HostEntry>,
    user_agent: String,
}

impl HostConnections {
    pub fn new<S: Into<String>>(user_agent: S) -> Self {
        Self {
            entries: HashMap::new(),
            user_agent: user_agent.into(),
        }
    }

    /// Issue a GET on the host's persistent connection, reconnecting
    /// first if the connection is missing, errored, or over budget.
    pub async fn get(&mut self, url: &str) -> HttpOutcome {
        let host = match host_key(url) {
            Some(h) => h,
            None => return HttpOutcome::failed(format!("bad url: {url}")),
        };
        let entry = match self.entry_for(&host) {
            Ok(e) => e,
            Err(err) => return HttpOutcome::failed(format!("client init: {err}")),
        };

        match entry.client.get(url).send().await {
            Ok(resp) => {
                entry.requests += 1;
                let status = resp.status().as_u16();
                match resp.bytes().await {
                    Ok(bytes) => HttpOutcome {
                        status: Some(status),
                        data: Some(bytes.to_vec()),
                        error: None,
                    },
                    Err(err) => {
                        entry.errored = true;
                        HttpOutcome::failed(format!("body read: {err}"))
                    }
                }
            }
            Err(err) => {
                entry.errored = true;
                HttpOutcome::failed(format!("{err}"))
            }
        }
    }

    fn entry_for(&mut self, host: &str) -> reqwest::Result<&mut HostEntry> {
        let stale = self
            .entries
            .get(host)
            .map(|e| e.errored || e.requests >= REQUESTS_PER_CONN)
            .unwrap_or(true);
        if stale {
            // dropping the old entry closes its pooled connection
            let client = self.build_client()?;
            self.entries.insert(
                host.to_string(),
                HostEntry {
                    client,
                    requests: 0,
                    errored: false,
                },
            );
        }
        Ok(self.entries.get_mut(host).unwrap())
    }

    fn build_client(&self) -> reqwest::Result<Client> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(CONNECTION, HeaderValue::from_static("Keep-Alive"));
        Client::builder()
            .user_agent(&self.user_agent)
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(1)
            .build()
    }

    #[cfg(test)]
    fn stats(&self, host: &str) -> Option<(u32, bool)> {
        self.entries.get(host).map(|e| (e.requests, e.errored))
    }

    #[cfg(test)]
    fn force(&mut self, host: &str, requests: u32, errored: bool) {
        let entry = self.entry_for(host).unwrap();
        entry.requests = requests;
        entry.errored = errored;
    }
}

/// Connection key: scheme + authority.
fn host_key(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}://{host}:{port}", parsed.scheme()),
        None => format!("{}://{host}", parsed.scheme()),
    })
}
