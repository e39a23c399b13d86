//! PostgREST reads + serverless stage-result endpoint calls for stagecheck.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use stagecheck_core::Record;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "stagecheck-rest";

pub const FETCH_STAGE_RESULTS: &str = "fetch-stage-results";
pub const FINALIZE_STAGE_RESULTS: &str = "finalize-stage-results";

const DEFAULT_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Error)]
pub enum RestError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    Fetch { status: u16, url: String, body: String },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no rows in {table} matching {filter}")]
    NotFound { table: String, filter: String },
    #[error("missing configuration: {0}")]
    Config(String),
}

impl RestError {
    pub fn status(&self) -> Option<u16> {
        match self {
            RestError::Fetch { status, .. } => Some(*status),
            RestError::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl RestConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: None,
        }
    }

    pub fn from_env() -> Result<Self, RestError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve configuration through `lookup`; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RestError> {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let base_url = var("SUPABASE_URL")
            .or_else(|| var("VITE_SUPABASE_URL"))
            .or_else(|| var("SUPABASE_PROJECT_REF").map(|r| format!("https://{r}.supabase.co")))
            .ok_or_else(|| {
                RestError::Config(
                    "set SUPABASE_URL, VITE_SUPABASE_URL or SUPABASE_PROJECT_REF".to_string(),
                )
            })?;
        let api_key = var("SUPABASE_ANON_KEY")
            .or_else(|| var("VITE_SUPABASE_ANON_KEY"))
            .ok_or_else(|| {
                RestError::Config("set SUPABASE_ANON_KEY or VITE_SUPABASE_ANON_KEY".to_string())
            })?;

        let mut config = Self::new(base_url, api_key);
        if let Some(secs) = var("STAGECHECK_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            config.timeout = Duration::from_secs(secs);
        }
        config.user_agent = var("STAGECHECK_USER_AGENT");
        Ok(config)
    }

    pub fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    pub fn function_url(&self, function: &str) -> String {
        format!("{}/functions/v1/{}", self.base_url, function)
    }

    pub fn auth_headers(&self) -> Vec<(String, String)> {
        vec![
            ("apikey".to_string(), self.api_key.clone()),
            (
                "Authorization".to_string(),
                format!("Bearer {}", self.api_key),
            ),
        ]
    }

    fn effective_user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| format!("{}/{}", CRATE_NAME, env!("CARGO_PKG_VERSION")))
    }
}

// ---------------------------------------------------------------------------
// Query builder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl FilterOp {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

impl Filter {
    fn encoded_value(&self) -> String {
        format!("{}.{}", self.op.as_str(), self.value)
    }
}

/// A single read against one table: projection, filters, ordering, limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    table: String,
    select: Vec<String>,
    filters: Vec<Filter>,
    order: Option<(String, bool)>,
    limit: Option<usize>,
}

impl Query {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            select: Vec::new(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn filter(mut self, column: impl Into<String>, op: FilterOp, value: impl ToString) -> Self {
        self.filters.push(Filter {
            column: column.into(),
            op,
            value: value.to_string(),
        });
        self
    }

    pub fn eq(self, column: impl Into<String>, value: impl ToString) -> Self {
        self.filter(column, FilterOp::Eq, value)
    }

    pub fn neq(self, column: impl Into<String>, value: impl ToString) -> Self {
        self.filter(column, FilterOp::Neq, value)
    }

    pub fn gt(self, column: impl Into<String>, value: impl ToString) -> Self {
        self.filter(column, FilterOp::Gt, value)
    }

    pub fn gte(self, column: impl Into<String>, value: impl ToString) -> Self {
        self.filter(column, FilterOp::Gte, value)
    }

    pub fn lt(self, column: impl Into<String>, value: impl ToString) -> Self {
        self.filter(column, FilterOp::Lt, value)
    }

    pub fn lte(self, column: impl Into<String>, value: impl ToString) -> Self {
        self.filter(column, FilterOp::Lte, value)
    }

    pub fn is_true(self, column: impl Into<String>) -> Self {
        self.filter(column, FilterOp::Eq, "true")
    }

    pub fn order_desc(mut self, column: impl Into<String>) -> Self {
        self.order = Some((column.into(), true));
        self
    }

    pub fn order_asc(mut self, column: impl Into<String>) -> Self {
        self.order = Some((column.into(), false));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Query-string pairs: `select`, filters in insertion order, `order`, `limit`.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::with_capacity(self.filters.len() + 3);
        let select = if self.select.is_empty() {
            "*".to_string()
        } else {
            self.select.join(",")
        };
        pairs.push(("select".to_string(), select));
        for f in &self.filters {
            pairs.push((f.column.clone(), f.encoded_value()));
        }
        if let Some((column, desc)) = &self.order {
            let dir = if *desc { "desc" } else { "asc" };
            pairs.push(("order".to_string(), format!("{column}.{dir}")));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        pairs
    }

    pub fn describe_filters(&self) -> String {
        if self.filters.is_empty() {
            return "<no filter>".to_string();
        }
        self.filters
            .iter()
            .map(|f| format!("{}={}", f.column, f.encoded_value()))
            .collect::<Vec<_>>()
            .join("&")
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub url: String,
    pub body: String,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The network seam. One request in, one complete response out.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
    ) -> Result<RawResponse, RestError>;

    async fn post_json(
        &self,
        url: &str,
        body: &JsonValue,
        headers: &[(String, String)],
    ) -> Result<RawResponse, RestError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &RestConfig) -> Result<Self, RestError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.effective_user_agent())
            .build()?;
        Ok(Self { client })
    }

    async fn finish(resp: reqwest::Response) -> Result<RawResponse, RestError> {
        let status = resp.status().as_u16();
        let url = resp.url().to_string();
        let body = resp.text().await?;
        Ok(RawResponse { status, url, body })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
    ) -> Result<RawResponse, RestError> {
        let mut req = self.client.get(url).query(query);
        for (name, value) in headers {
            req = req.header(name.as_str(), value.as_str());
        }
        Self::finish(req.send().await?).await
    }

    async fn post_json(
        &self,
        url: &str,
        body: &JsonValue,
        headers: &[(String, String)],
    ) -> Result<RawResponse, RestError> {
        let mut req = self.client.post(url).json(body);
        for (name, value) in headers {
            req = req.header(name.as_str(), value.as_str());
        }
        Self::finish(req.send().await?).await
    }
}

// ---------------------------------------------------------------------------
// Table reads
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RestClient {
    config: RestConfig,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

impl RestClient {
    pub fn new(config: RestConfig) -> Result<Self, RestError> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: RestConfig, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    pub fn config(&self) -> &RestConfig {
        &self.config
    }

    pub async fn fetch(&self, query: &Query) -> Result<Vec<Record>, RestError> {
        self.fetch_as(query).await
    }

    pub async fn fetch_as<T: DeserializeOwned>(&self, query: &Query) -> Result<Vec<T>, RestError> {
        let url = self.config.rest_url(query.table_name());
        let span = info_span!("rest_fetch", table = query.table_name(), url = %url);

        async {
            let resp = self
                .transport
                .get(&url, &query.to_pairs(), &self.config.auth_headers())
                .await?;
            debug!(status = resp.status, bytes = resp.body.len(), "rest response");

            if !resp.is_success() {
                return Err(RestError::Fetch {
                    status: resp.status,
                    url: resp.url,
                    body: resp.body,
                });
            }

            let rows: Vec<T> = serde_json::from_str(&resp.body).map_err(|source| {
                RestError::Decode {
                    url: resp.url.clone(),
                    source,
                }
            })?;
            debug!(rows = rows.len(), "decoded rows");
            Ok(rows)
        }
        .instrument(span)
        .await
    }

    /// First row of a lookup that must match something.
    pub async fn fetch_first_as<T: DeserializeOwned>(&self, query: &Query) -> Result<T, RestError> {
        self.fetch_as(query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RestError::NotFound {
                table: query.table_name().to_string(),
                filter: query.describe_filters(),
            })
    }
}

// ---------------------------------------------------------------------------
// Serverless endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum FunctionBody {
    Json(JsonValue),
    Text(String),
}

/// Endpoint reply, kept whatever the status so callers can show it.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionResponse {
    pub status: u16,
    pub body: FunctionBody,
}

impl FunctionResponse {
    pub fn from_raw(raw: RawResponse) -> Self {
        let body = match serde_json::from_str::<JsonValue>(&raw.body) {
            Ok(value) => FunctionBody::Json(value),
            Err(_) => FunctionBody::Text(raw.body),
        };
        Self {
            status: raw.status,
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Option<&JsonValue> {
        match &self.body {
            FunctionBody::Json(v) => Some(v),
            FunctionBody::Text(_) => None,
        }
    }

    pub fn results(&self) -> Option<&Vec<JsonValue>> {
        self.json()?.get("results")?.as_array()
    }

    /// `results` is present but empty: background processing has not
    /// finished yet.
    pub fn results_pending(&self) -> bool {
        matches!(self.results(), Some(results) if results.is_empty())
    }

    pub fn error_message(&self) -> Option<&str> {
        self.json()?.get("error")?.as_str()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.json().map(|v| T::deserialize(v))
    }

    pub fn pretty_body(&self) -> String {
        match &self.body {
            FunctionBody::Json(v) => serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string()),
            FunctionBody::Text(t) => t.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeResult {
    pub result_id: String,
    pub official_time_seconds: u64,
    pub mountain_points: u32,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeRequest {
    pub stage_id: String,
    pub results: Vec<FinalizeResult>,
}

impl FinalizeRequest {
    pub const TEST_MOUNTAIN_POINTS: u32 = 10;

    /// One official result, as used for manual publish checks.
    pub fn single(stage_id: impl Into<String>, result_id: impl Into<String>, seconds: u64) -> Self {
        Self {
            stage_id: stage_id.into(),
            results: vec![FinalizeResult {
                result_id: result_id.into(),
                official_time_seconds: seconds,
                mountain_points: Self::TEST_MOUNTAIN_POINTS,
                status: "official".to_string(),
            }],
        }
    }
}

#[derive(Clone)]
pub struct FunctionsClient {
    config: RestConfig,
    transport: Arc<dyn Transport>,
}

impl FunctionsClient {
    pub fn new(config: RestConfig) -> Result<Self, RestError> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: RestConfig, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    pub fn function_url(&self, function: &str) -> String {
        self.config.function_url(function)
    }

    pub async fn fetch_stage_results(&self, stage_id: &str) -> Result<FunctionResponse, RestError> {
        let url = self.config.function_url(FETCH_STAGE_RESULTS);
        let query = vec![("stage_id".to_string(), stage_id.to_string())];
        let raw = self
            .transport
            .get(&url, &query, &self.config.auth_headers())
            .instrument(info_span!("function_call", function = FETCH_STAGE_RESULTS, stage_id))
            .await?;
        debug!(status = raw.status, "function response");
        Ok(FunctionResponse::from_raw(raw))
    }

    pub async fn finalize_stage_results(
        &self,
        request: &FinalizeRequest,
    ) -> Result<FunctionResponse, RestError> {
        let url = self.config.function_url(FINALIZE_STAGE_RESULTS);
        let body = serde_json::to_value(request).map_err(|source| RestError::Decode {
            url: url.clone(),
            source,
        })?;
        let raw = self
            .transport
            .post_json(&url, &body, &self.config.auth_headers())
            .instrument(info_span!(
                "function_call",
                function = FINALIZE_STAGE_RESULTS,
                stage_id = %request.stage_id
            ))
            .await?;
        debug!(status = raw.status, "function response");
        Ok(FunctionResponse::from_raw(raw))
    }
}
