//! HTTP client for the graphite-web render API.
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, AUTHORIZATION};
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use indexmap::IndexMap;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, error};

use crate::common::{BackendError, BuildError};

/// Value given to the newest datapoint of a series whose datapoints are all null.
pub const NULL_SENTINEL: f64 = -1.0;

/// A single `(value, timestamp)` pair of a series.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
pub struct Datapoint(pub Option<f64>, pub i64);

impl Datapoint {
    /// The value, if graphite had one for this slot.
    pub fn value(&self) -> Option<f64> {
        self.0
    }

    /// Seconds since the Unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.1
    }
}

/// One series of a render response.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SeriesResult {
    /// The series name, or its alias.
    pub target: String,
    /// Tags attached by graphite, such as `name` and `aggregatedBy`.
    #[serde(default)]
    pub tags: IndexMap<String, serde_json::Value>,
    /// Datapoints, oldest first.
    #[serde(default)]
    pub datapoints: Vec<Datapoint>,
}

impl SeriesResult {
    /// The newest non-null value of this series.
    pub fn latest_value(&self) -> Option<f64> {
        self.datapoints.iter().rev().find_map(Datapoint::value)
    }

    /// Forces the newest datapoint to [`NULL_SENTINEL`] when no datapoint has a value.
    ///
    /// Series with at least one value, and series with no datapoints at all, are left untouched.
    pub fn substitute_all_null(&mut self) {
        if self.datapoints.iter().all(|dp| dp.0.is_none()) {
            if let Some(last) = self.datapoints.last_mut() {
                last.0 = Some(NULL_SENTINEL);
            }
        }
    }
}

/// Decodes a render response body, applying the all-null substitution to every series.
///
/// # Errors
///
/// Returns [`BackendError::Decode`] if the body is not a JSON array of series.
pub fn decode_series(body: &[u8]) -> Result<Vec<SeriesResult>, BackendError> {
    let mut series: Vec<SeriesResult> = serde_json::from_slice(body)?;
    for s in &mut series {
        s.substitute_all_null();
    }
    Ok(series)
}

/// Connection, pooling and retry settings of a [`GraphiteClient`].
#[derive(Clone, Debug)]
pub struct ClientSettings {
    /// graphite-web replicas. One is picked at random for every attempt.
    pub hosts: Vec<String>,
    /// Port graphite-web listens on, shared by every replica.
    pub port: u16,
    /// Idle keep-alive connections retained per replica.
    pub pool_maxsize: usize,
    /// When set, at most `pool_maxsize` requests are in flight at once and further requests wait
    /// for a free slot. Otherwise extra requests proceed on connections that are not retained.
    pub pool_block: bool,
    /// How long an idle connection is kept around.
    pub pool_idle_timeout: Duration,
    /// How many times a request failing with a transport error or a timeout is retried.
    pub max_retries: u32,
    /// Delay before the first retry. Each further retry doubles it.
    pub retry_backoff: Duration,
    /// Request timeout, used when a call does not supply its own.
    pub timeout: Duration,
    /// Optional HTTP basic auth credentials.
    pub basic_auth: Option<(String, Option<String>)>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            hosts: vec!["127.0.0.1".to_owned()],
            port: 5000,
            pool_maxsize: 10,
            pool_block: false,
            pool_idle_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            timeout: Duration::from_secs(10),
            basic_auth: None,
        }
    }
}

/// Queries graphite-web replicas for series data.
pub struct GraphiteClient {
    client: Client<HttpConnector, Empty<Bytes>>,
    settings: ClientSettings,
    auth: Option<HeaderValue>,
    limiter: Option<Arc<Semaphore>>,
}

impl GraphiteClient {
    /// Creates a new [`GraphiteClient`].
    ///
    /// ## Errors
    ///
    /// Returns [`BuildError::NoBackendHosts`] if `settings` names no hosts.
    pub fn new(settings: ClientSettings) -> Result<Self, BuildError> {
        if settings.hosts.is_empty() {
            return Err(BuildError::NoBackendHosts);
        }

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(settings.timeout));
        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(settings.pool_idle_timeout)
            .pool_max_idle_per_host(settings.pool_maxsize)
            .build(connector);

        let auth = settings
            .basic_auth
            .as_ref()
            .map(|(username, password)| basic_auth(username, password.as_deref()));
        let limiter = settings.pool_block.then(|| Arc::new(Semaphore::new(settings.pool_maxsize.max(1))));

        Ok(Self { client, settings, auth, limiter })
    }

    /// Requests `path` from a randomly chosen replica and decodes the series in the response.
    ///
    /// `timeout` overrides the client's default timeout for this call. Transport errors and
    /// timeouts are retried, against a freshly chosen replica, up to `max_retries` times with
    /// exponential backoff. A non-success status is logged and returned immediately as
    /// [`BackendError::Unavailable`].
    ///
    /// ## Errors
    ///
    /// Returns the error of the last attempt if every attempt failed.
    pub async fn request(
        &self,
        path: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<SeriesResult>, BackendError> {
        let timeout = timeout.unwrap_or(self.settings.timeout);

        // The semaphore is never closed, so acquiring only fails if it is, in which case we do
        // without a permit.
        let _permit = match &self.limiter {
            Some(limiter) => limiter.acquire().await.ok(),
            None => None,
        };

        let mut attempt = 0;
        loop {
            let uri = self.render_uri(path)?;
            match self.send(uri, path, timeout).await {
                Ok(series) => return Ok(series),
                Err(e) if e.is_transient() && attempt < self.settings.max_retries => {
                    let backoff =
                        self.settings.retry_backoff.saturating_mul(2u32.saturating_pow(attempt));
                    debug!(path, attempt, ?backoff, error = %e, "retrying graphite request");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send(
        &self,
        uri: Uri,
        path: &str,
        timeout: Duration,
    ) -> Result<Vec<SeriesResult>, BackendError> {
        let mut builder = Request::builder().method(Method::GET).uri(uri);
        if let Some(auth) = &self.auth {
            builder = builder.header(AUTHORIZATION, auth.clone());
        }
        let req = builder.body(Empty::new()).map_err(|e| BackendError::InvalidUri {
            uri: path.to_owned(),
            reason: e.to_string(),
        })?;

        let exchange = async {
            let response = self.client.request(req).await?;
            let status = response.status();
            let body = response.into_body().collect().await?.to_bytes();
            Ok::<_, BackendError>((status, body))
        };
        let (status, body) = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| BackendError::Timeout(timeout))??;

        if !status.is_success() {
            let body = String::from_utf8_lossy(&body).into_owned();
            error!(
                message = "can't access graphite",
                path,
                status = status.as_u16(),
                %body,
            );
            return Err(BackendError::Unavailable { status, body });
        }

        decode_series(&body)
    }

    fn render_uri(&self, path: &str) -> Result<Uri, BackendError> {
        let uri = format!("http://{}:{}{}", self.pick_host(), self.settings.port, path);
        Uri::try_from(uri.as_str())
            .map_err(|e| BackendError::InvalidUri { uri, reason: e.to_string() })
    }

    fn pick_host(&self) -> &str {
        // `new` refuses an empty host list, so the range is never empty.
        let index = rand::rng().random_range(0..self.settings.hosts.len());
        &self.settings.hosts[index]
    }
}

fn basic_auth(username: &str, password: Option<&str>) -> HeaderValue {
    use base64::prelude::BASE64_STANDARD;
    use base64::write::EncoderWriter;
    use std::io::Write;

    let mut buf = b"Basic ".to_vec();
    {
        let mut encoder = EncoderWriter::new(&mut buf, &BASE64_STANDARD);
        write!(encoder, "{username}:").expect("should not fail to encode username");
        if let Some(password) = password {
            write!(encoder, "{password}").expect("should not fail to encode password");
        }
    }
    let mut header = HeaderValue::from_bytes(&buf).expect("base64 is always valid HeaderValue");
    header.set_sensitive(true);
    header
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{basic_auth, decode_series, ClientSettings, GraphiteClient, NULL_SENTINEL};
    use crate::config::render_path;
    use crate::common::{BackendError, BuildError};

    const RESPONSE: &str = r#"[
        {
            "target": "carbon_update_operations",
            "tags": {"name": "carbon.agents.a.updateOperations", "aggregatedBy": "sum"},
            "datapoints": [[45.0, 1676738680], [null, 1676738740]]
        },
        {
            "target": "carbon_creates",
            "tags": {},
            "datapoints": [[null, 1676738680], [null, 1676738740]]
        },
        {
            "target": "empty",
            "datapoints": []
        }
    ]"#;

    #[test]
    fn test_decode_series() {
        let series = decode_series(RESPONSE.as_bytes()).unwrap();
        assert_eq!(series.len(), 3);

        let updates = &series[0];
        assert_eq!(updates.target, "carbon_update_operations");
        assert_eq!(updates.tags["aggregatedBy"], "sum");
        assert_eq!(updates.datapoints[0].timestamp(), 1676738680);
        // A series with a value keeps its trailing null.
        assert_eq!(updates.datapoints[1].value(), None);
        assert_eq!(updates.latest_value(), Some(45.0));

        let creates = &series[1];
        assert_eq!(creates.datapoints[0].value(), None);
        assert_eq!(creates.datapoints[1].value(), Some(NULL_SENTINEL));
        assert_eq!(creates.latest_value(), Some(NULL_SENTINEL));

        let empty = &series[2];
        assert!(empty.tags.is_empty());
        assert_eq!(empty.latest_value(), None);
    }

    #[test]
    fn test_latest_value_scans_from_newest() {
        let series = decode_series(
            br#"[{"target": "a", "datapoints": [[1.0, 1], [0.0, 2], [null, 3]]}]"#,
        )
        .unwrap();

        // Zero is a real value, not a missing one.
        assert_eq!(series[0].latest_value(), Some(0.0));
    }

    #[test]
    fn test_decode_rejects_unexpected_shape() {
        let result = decode_series(br#"{"error": "bad target"}"#);
        assert!(matches!(result, Err(BackendError::Decode(_))));
    }

    #[test]
    fn test_client_requires_hosts() {
        let settings = ClientSettings { hosts: vec![], ..ClientSettings::default() };
        assert!(matches!(GraphiteClient::new(settings), Err(BuildError::NoBackendHosts)));
    }

    #[test]
    fn test_render_uri_uses_every_replica() {
        let settings = ClientSettings {
            hosts: vec!["10.0.0.1".to_owned(), "10.0.0.2".to_owned()],
            port: 8080,
            ..ClientSettings::default()
        };
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let _guard = runtime.enter();
        let client = GraphiteClient::new(settings).unwrap();

        let mut authorities = HashSet::new();
        for _ in 0..200 {
            let uri = client.render_uri("/render?format=json&target=a.b").unwrap();
            assert_eq!(uri.path(), "/render");
            assert_eq!(uri.query(), Some("format=json&target=a.b"));
            authorities.insert(uri.authority().unwrap().to_string());
        }

        let expected = ["10.0.0.1:8080", "10.0.0.2:8080"].iter().map(|s| s.to_string()).collect();
        assert_eq!(authorities, expected);
    }

    #[test]
    fn test_render_uri_accepts_quoted_targets() {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let _guard = runtime.enter();
        let client = GraphiteClient::new(ClientSettings::default()).unwrap();

        let path = render_path(
            "-2min",
            "-1min",
            ["alias(sumSeries(example.*.*.dau), 'total users')", "example.app1.\"x\".dau"],
        );
        let uri = client.render_uri(&path).unwrap();
        assert_eq!(
            uri.query(),
            Some(concat!(
                "format=json&from=-2min&until=-1min",
                "&target=alias(sumSeries(example.*.*.dau),%20'total%20users')",
                "&target=example.app1.%22x%22.dau",
            ))
        );
    }

    #[test]
    pub fn test_basic_auth() {
        use base64::prelude::BASE64_STANDARD;
        use base64::read::DecoderReader;
        use std::io::Read;

        const BASIC: &str = "Basic ";

        let header = basic_auth("graphite", Some("s3cret!"));
        let reader = &header.as_ref()[BASIC.len()..];
        let mut decoder = DecoderReader::new(reader, &BASE64_STANDARD);
        let mut result = Vec::new();
        decoder.read_to_end(&mut result).unwrap();
        assert_eq!(b"graphite:s3cret!", &result[..]);
        assert!(header.is_sensitive());
    }
}
