//! Endpoint resolution and the pooled HTTP transport.

use crate::config::{Auth, RecordType, Region, RunConfig};
use crate::error::{IngestError, Result};
use crate::io::compression::gzip_bytes;
use bytes::Bytes;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderValue, RETRY_AFTER};
use reqwest::{Client, Method, StatusCode, Url};
use std::time::Duration;
use tracing::trace;

/// Base URL for a region.
#[must_use]
pub fn region_base(region: Region) -> &'static str {
    match region {
        Region::Us => "https://api.mixpanel.com",
        Region::Eu => "https://api-eu.mixpanel.com",
        Region::In => "https://api-in.mixpanel.com",
    }
}

/// Where and how a run's batches are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub method: Method,
    pub url: Url,
    pub content_type: &'static str,
}

impl Endpoint {
    /// Resolve the endpoint for `config`.
    ///
    /// # Errors
    /// Returns [`IngestError::Config`] if the base URL is unusable or a table
    /// run has no id.
    pub fn for_config(config: &RunConfig) -> Result<Self> {
        let base = config
            .api_base
            .as_deref()
            .unwrap_or_else(|| region_base(config.region));
        let mut url = Url::parse(base)
            .map_err(|e| IngestError::Config(format!("unusable endpoint {base}: {e}")))?;
        if url.cannot_be_a_base() {
            return Err(IngestError::Config(format!("unusable endpoint {base}")));
        }
        let (method, path, content_type) = match config.record_type {
            RecordType::Event => (Method::POST, "import".to_string(), "application/json"),
            RecordType::User => (Method::POST, "engage".to_string(), "application/json"),
            RecordType::Group => (Method::POST, "groups".to_string(), "application/json"),
            RecordType::Table => {
                let id = config.table_id.as_deref().ok_or_else(|| {
                    IngestError::Config("record_type \"table\" requires table_id".into())
                })?;
                (Method::PUT, format!("lookup-tables/{id}"), "text/csv")
            }
        };
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| IngestError::Config(format!("unusable endpoint {base}")))?;
            segments.pop_if_empty();
            for part in path.split('/') {
                segments.push(part);
            }
        }
        {
            let mut query = url.query_pairs_mut();
            if config.record_type != RecordType::Table {
                query
                    .append_pair("ip", "0")
                    .append_pair("verbose", "1")
                    .append_pair("strict", if config.strict { "1" } else { "0" });
            }
            if let Some(project) = &config.project_id {
                query.append_pair("project_id", project);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(Self {
            method,
            url,
            content_type,
        })
    }
}

/// A completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub body: String,
    pub retry_after: Option<Duration>,
}

/// One connection pool per run, shared by every dispatch task.
#[derive(Debug, Clone)]
pub struct Transport {
    client: Client,
    endpoint: Endpoint,
    auth: Option<Auth>,
    compress: bool,
    compression_level: u32,
    first_byte_timeout: Duration,
}

impl Transport {
    /// Build the client: keep-alive pool sized to `workers`, TCP keepalive,
    /// and a total per-request timeout.
    ///
    /// # Errors
    /// Returns configuration errors from endpoint resolution or the TLS
    /// backend.
    pub fn new(config: &RunConfig, workers: usize) -> Result<Self> {
        let endpoint = Endpoint::for_config(config)?;
        let client = Client::builder()
            .pool_max_idle_per_host(workers.max(1))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .timeout(config.request_timeout())
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IngestError::Config(format!("build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            auth: config.auth.clone(),
            compress: config.compress,
            compression_level: config.compression_level,
            first_byte_timeout: config.first_byte_timeout(),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Compress `body` if the run asks for it. Done once per batch, not per
    /// attempt.
    ///
    /// # Errors
    /// Only fails if the encoder fails.
    pub fn encode_body(&self, body: Vec<u8>) -> Result<Bytes> {
        if !self.compress {
            return Ok(Bytes::from(body));
        }
        let gz = gzip_bytes(&body, self.compression_level)
            .map_err(|e| IngestError::Other(anyhow::Error::new(e).context("gzip request body")))?;
        Ok(Bytes::from(gz))
    }

    /// Send one attempt. Headers must arrive within the first-byte timeout;
    /// the whole exchange within the client's total timeout.
    ///
    /// # Errors
    /// Returns [`IngestError::Timeout`] or [`IngestError::Transport`]; HTTP
    /// error statuses are returned as a [`RawResponse`], not an error.
    pub async fn send(&self, body: Bytes) -> Result<RawResponse> {
        let mut request = self
            .client
            .request(self.endpoint.method.clone(), self.endpoint.url.clone())
            .header(CONTENT_TYPE, self.endpoint.content_type)
            .header("Accept", "application/json")
            .body(body);
        if self.compress {
            request = request.header(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }
        request = match &self.auth {
            Some(Auth::ServiceAccount { username, secret }) => {
                request.basic_auth(username, Some(secret))
            }
            Some(Auth::ApiSecret { secret }) => request.basic_auth(secret, Some("")),
            Some(Auth::Bearer { token }) => request.bearer_auth(token),
            None => request,
        };

        let response = tokio::time::timeout(self.first_byte_timeout, request.send())
            .await
            .map_err(|_| IngestError::Timeout(self.first_byte_timeout))??;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await?;
        trace!(%status, bytes = body.len(), "response received");
        Ok(RawResponse {
            status,
            body,
            retry_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(record_type: RecordType) -> RunConfig {
        RunConfig {
            record_type,
            dry_run: true,
            ..RunConfig::default()
        }
    }

    #[test]
    fn event_endpoint_per_region() {
        let mut c = cfg(RecordType::Event);
        c.region = Region::Eu;
        c.strict = false;
        let ep = Endpoint::for_config(&c).unwrap();
        assert_eq!(ep.method, Method::POST);
        assert_eq!(
            ep.url.as_str(),
            "https://api-eu.mixpanel.com/import?ip=0&verbose=1&strict=0"
        );
    }

    #[test]
    fn profile_and_group_paths() {
        let mut c = cfg(RecordType::User);
        c.project_id = Some("42".into());
        let ep = Endpoint::for_config(&c).unwrap();
        assert_eq!(ep.url.path(), "/engage");
        assert!(ep.url.query().unwrap().ends_with("project_id=42"));
        assert_eq!(
            Endpoint::for_config(&cfg(RecordType::Group)).unwrap().url.path(),
            "/groups"
        );
    }

    #[test]
    fn table_upload_is_put_csv() {
        let mut c = cfg(RecordType::Table);
        c.table_id = Some("tbl-1".into());
        c.api_base = Some("http://localhost:9999/proxy/".into());
        let ep = Endpoint::for_config(&c).unwrap();
        assert_eq!(ep.method, Method::PUT);
        assert_eq!(ep.content_type, "text/csv");
        assert_eq!(ep.url.as_str(), "http://localhost:9999/proxy/lookup-tables/tbl-1");
    }

    #[test]
    fn gzip_body_when_enabled() {
        let mut c = cfg(RecordType::Event);
        c.compress = true;
        let t = Transport::new(&c, 2).unwrap();
        let body = t.encode_body(b"[{}]".to_vec()).unwrap();
        assert_eq!(&body[..2], &[0x1f, 0x8b]);
    }
}
