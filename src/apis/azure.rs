use crate::apis::retain_in_range;
use crate::config::{AzureConfig, IngestionConfig};
use crate::error::{CostError, ProviderError};
use crate::infra::http_client::{build_client, read_json, retry_with_backoff, RetryPolicy};
use crate::types::{CostSource, Provider, RawDate, RawRecord};
use chrono::NaiveDate;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};

const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";

const DATE_COLUMNS: [&str; 2] = ["UsageDate", "Date"];
const SERVICE_COLUMNS: [&str; 1] = ["ServiceName"];
const COST_COLUMNS: [&str; 4] = ["Cost", "PreTaxCost", "totalCost", "CostUSD"];

enum TokenSource {
    Static(String),
    ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
    },
}

impl std::fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenSource::Static(_) => f.write_str("Static(<redacted>)"),
            TokenSource::ClientCredentials { token_url, client_id, .. } => f
                .debug_struct("ClientCredentials")
                .field("token_url", token_url)
                .field("client_id", client_id)
                .finish(),
        }
    }
}

/// Cost Management `query` for one subscription, daily, grouped by service.
pub struct AzureCostSource {
    client: reqwest::Client,
    query_url: String,
    token: TokenSource,
    retry: RetryPolicy,
}

impl AzureCostSource {
    pub fn new(config: &AzureConfig, ingestion: &IngestionConfig) -> Result<Self, CostError> {
        let subscription = config
            .subscription_id
            .as_deref()
            .ok_or_else(|| CostError::Validation("Missing AZURE_SUBSCRIPTION_ID".to_string()))?;

        let token = match (&config.access_token, &config.tenant_id, &config.client_id, &config.client_secret) {
            (Some(token), _, _, _) => TokenSource::Static(token.clone()),
            (None, Some(tenant), Some(client_id), Some(client_secret)) => TokenSource::ClientCredentials {
                token_url: format!(
                    "{}/{}/oauth2/v2.0/token",
                    config.login_endpoint.trim_end_matches('/'),
                    tenant
                ),
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
            },
            _ => {
                return Err(CostError::Validation(
                    "Missing AZURE_ACCESS_TOKEN or AZURE_TENANT_ID/AZURE_CLIENT_ID/AZURE_CLIENT_SECRET"
                        .to_string(),
                ))
            }
        };

        let query_url = format!(
            "{}/subscriptions/{}/providers/Microsoft.CostManagement/query?api-version={}",
            config.management_endpoint.trim_end_matches('/'),
            subscription,
            config.api_version
        );
        let client = build_client(ingestion.request_timeout())
            .map_err(|e| CostError::ingestion(Provider::Azure, e))?;

        Ok(Self {
            client,
            query_url,
            token,
            retry: ingestion.retry_policy(),
        })
    }

    async fn bearer_token(&self) -> Result<String, ProviderError> {
        match &self.token {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::ClientCredentials { token_url, client_id, client_secret } => {
                let form = [
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                    ("scope", MANAGEMENT_SCOPE),
                ];
                let (client, form) = (&self.client, &form);
                let resp: TokenResponse = retry_with_backoff(self.retry, "azure.token", move || async move {
                    read_json(client.post(token_url).form(form).send().await?).await
                })
                .await
                .map_err(|e| match e {
                    ProviderError::Status { status, body } => {
                        ProviderError::Auth(format!("token endpoint returned {status}: {body}"))
                    }
                    other => other,
                })?;
                Ok(resp.access_token)
            }
        }
    }
}

#[async_trait::async_trait]
impl CostSource for AzureCostSource {
    fn provider(&self) -> Provider {
        Provider::Azure
    }

    #[instrument(skip(self))]
    async fn fetch(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<RawRecord>, ProviderError> {
        let token = self.bearer_token().await?;
        let body = QueryDefinition::daily_by_service(start, end);

        let (client, url, token, body) = (&self.client, &self.query_url, &token, &body);
        let resp: QueryResponse = retry_with_backoff(self.retry, "azure.query", move || async move {
            read_json(
                client
                    .post(url)
                    .bearer_auth(token)
                    .json(body)
                    .send()
                    .await?,
            )
            .await
        })
        .await?;
        counter!("finops_provider_pages_total", "provider" => "azure").increment(1);

        let Some(properties) = resp.properties else {
            debug!("query response carried no properties");
            return Ok(Vec::new());
        };
        let records = rows_to_records(&properties.columns, properties.rows)?;
        let records = retain_in_range(records, start, end);
        info!(records = records.len(), "fetched Azure cost rows");
        Ok(records)
    }
}

/// Column positions of `(date, service, cost)` within a row.
#[derive(Debug, PartialEq)]
struct ColumnLayout {
    date: usize,
    service: usize,
    cost: usize,
}

impl ColumnLayout {
    fn resolve(columns: &[Column]) -> Result<Self, ProviderError> {
        if columns.is_empty() {
            return Ok(Self { date: 0, service: 1, cost: 2 });
        }
        let find = |names: &[&str]| {
            columns
                .iter()
                .position(|c| names.iter().any(|n| c.name.eq_ignore_ascii_case(n)))
                .ok_or_else(|| {
                    ProviderError::Decode(format!("response has no {} column", names.join("/")))
                })
        };
        Ok(Self {
            date: find(&DATE_COLUMNS)?,
            service: find(&SERVICE_COLUMNS)?,
            cost: find(&COST_COLUMNS)?,
        })
    }
}

fn rows_to_records(columns: &[Column], rows: Vec<Vec<Value>>) -> Result<Vec<RawRecord>, ProviderError> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let layout = ColumnLayout::resolve(columns)?;
    Ok(rows
        .into_iter()
        .map(|row| RawRecord {
            date: date_cell(row.get(layout.date)),
            service: service_cell(row.get(layout.service)),
            cost_usd: cost_cell(row.get(layout.cost)),
        })
        .collect())
}

fn date_cell(value: Option<&Value>) -> RawDate {
    match value {
        Some(Value::Number(n)) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => RawDate::Numeric(i),
            (None, Some(f)) if f.fract() == 0.0 => RawDate::Numeric(f as i64),
            _ => RawDate::Text(n.to_string()),
        },
        Some(Value::String(s)) => RawDate::Text(s.clone()),
        Some(Value::Null) | None => RawDate::Missing,
        Some(other) => RawDate::Text(other.to_string()),
    }
}

fn service_cell(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn cost_cell(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryDefinition {
    #[serde(rename = "type")]
    kind: &'static str,
    timeframe: &'static str,
    time_period: QueryTimePeriod,
    dataset: QueryDataset,
}

#[derive(Serialize)]
struct QueryTimePeriod {
    from: String,
    to: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryDataset {
    granularity: &'static str,
    aggregation: serde_json::Map<String, Value>,
    grouping: Vec<QueryGrouping>,
}

#[derive(Serialize)]
struct QueryGrouping {
    #[serde(rename = "type")]
    kind: &'static str,
    name: &'static str,
}

impl QueryDefinition {
    fn daily_by_service(start: NaiveDate, end: NaiveDate) -> Self {
        let mut aggregation = serde_json::Map::new();
        aggregation.insert(
            "totalCost".to_string(),
            serde_json::json!({ "name": "Cost", "function": "Sum" }),
        );
        Self {
            kind: "Usage",
            timeframe: "Custom",
            time_period: QueryTimePeriod {
                from: format!("{start}T00:00:00Z"),
                to: format!("{end}T23:59:59Z"),
            },
            dataset: QueryDataset {
                granularity: "Daily",
                aggregation,
                grouping: vec![QueryGrouping { kind: "Dimension", name: "ServiceName" }],
            },
        }
    }
}

#[derive(Deserialize)]
struct QueryResponse {
    properties: Option<QueryProperties>,
}

#[derive(Deserialize)]
struct QueryProperties {
    #[serde(default)]
    columns: Vec<Column>,
    #[serde(default)]
    rows: Vec<Vec<Value>>,
}

#[derive(Deserialize)]
struct Column {
    name: String,
}
