use crate::apis::retain_in_range;
use crate::config::{GcpConfig, IngestionConfig};
use crate::error::{CostError, ProviderError};
use crate::infra::http_client::{build_client, read_json, retry_with_backoff, RetryPolicy};
use crate::types::{CostSource, Provider, RawDate, RawRecord};
use chrono::NaiveDate;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};

const QUERY_TIMEOUT_MS: u64 = 10_000;

/// BigQuery billing export, queried with named `DATE` parameters.
pub struct GcpCostSource {
    client: reqwest::Client,
    queries_url: String,
    metadata_token_url: String,
    access_token: Option<String>,
    sql: String,
    max_polls: u32,
    retry: RetryPolicy,
}

impl GcpCostSource {
    pub fn new(config: &GcpConfig, ingestion: &IngestionConfig) -> Result<Self, CostError> {
        let project = required(&config.project_id, "GCP_PROJECT_ID")?;
        let dataset = required(&config.dataset, "GCP_DATASET")?;
        let table = required(&config.table, "GCP_TABLE")?;

        check_identifier("project", project, |c| c.is_ascii_alphanumeric() || "-.:".contains(c))?;
        check_identifier("dataset", dataset, |c| c.is_ascii_alphanumeric() || c == '_')?;
        check_identifier("table", table, |c| c.is_ascii_alphanumeric() || "_-".contains(c))?;

        let client = build_client(ingestion.request_timeout())
            .map_err(|e| CostError::ingestion(Provider::Gcp, e))?;

        Ok(Self {
            client,
            queries_url: format!(
                "{}/bigquery/v2/projects/{}/queries",
                config.endpoint.trim_end_matches('/'),
                project
            ),
            metadata_token_url: format!(
                "{}/computeMetadata/v1/instance/service-accounts/default/token",
                config.metadata_endpoint.trim_end_matches('/')
            ),
            access_token: config.access_token.clone(),
            sql: billing_sql(project, dataset, table),
            max_polls: ingestion.max_result_polls,
            retry: ingestion.retry_policy(),
        })
    }

    async fn bearer_token(&self) -> Result<String, ProviderError> {
        if let Some(token) = &self.access_token {
            return Ok(token.clone());
        }
        let (client, url) = (&self.client, &self.metadata_token_url);
        let resp: MetadataToken = retry_with_backoff(self.retry, "gcp.metadata_token", move || async move {
            read_json(client.get(url).header("Metadata-Flavor", "Google").send().await?).await
        })
        .await
        .map_err(|e| ProviderError::Auth(format!("no GCP_ACCESS_TOKEN and metadata server failed: {e}")))?;
        Ok(resp.access_token)
    }

    async fn query_results(
        &self,
        token: &str,
        job: &JobReference,
        page_token: Option<&str>,
    ) -> Result<QueryResponse, ProviderError> {
        let url = format!("{}/{}", self.queries_url, job.job_id);
        let mut params: Vec<(&str, String)> = vec![("timeoutMs", QUERY_TIMEOUT_MS.to_string())];
        if let Some(location) = &job.location {
            params.push(("location", location.clone()));
        }
        if let Some(page) = page_token {
            params.push(("pageToken", page.to_string()));
        }
        let (client, url, params) = (&self.client, &url, &params);
        retry_with_backoff(self.retry, "gcp.get_query_results", move || async move {
            read_json(client.get(url).bearer_auth(token).query(params).send().await?).await
        })
        .await
    }
}

#[async_trait::async_trait]
impl CostSource for GcpCostSource {
    fn provider(&self) -> Provider {
        Provider::Gcp
    }

    #[instrument(skip(self))]
    async fn fetch(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<RawRecord>, ProviderError> {
        let token = self.bearer_token().await?;
        let request = QueryRequest {
            query: &self.sql,
            use_legacy_sql: false,
            parameter_mode: "NAMED",
            query_parameters: vec![date_param("start", start), date_param("end", end)],
            timeout_ms: QUERY_TIMEOUT_MS,
        };

        let (client, url, token_ref, request) = (&self.client, &self.queries_url, &token, &request);
        let mut page: QueryResponse = retry_with_backoff(self.retry, "gcp.jobs_query", move || async move {
            read_json(client.post(url).bearer_auth(token_ref).json(request).send().await?).await
        })
        .await?;

        let mut records = Vec::new();
        let mut layout: Option<ColumnLayout> = None;
        let mut polls = 0u32;

        loop {
            counter!("finops_provider_pages_total", "provider" => "gcp").increment(1);

            let next_page = if page.job_complete {
                if layout.is_none() {
                    layout = Some(ColumnLayout::from_schema(page.schema.as_ref()));
                }
                if let Some(layout) = &layout {
                    records.extend(page.rows.iter().map(|row| layout.record(row)));
                }
                match page.page_token.take().filter(|t| !t.is_empty()) {
                    Some(next) => Some(next),
                    None => break,
                }
            } else {
                // Result pages do not count against the poll budget.
                polls += 1;
                if polls > self.max_polls {
                    return Err(ProviderError::Decode(format!(
                        "query results still pending after {} polls",
                        self.max_polls
                    )));
                }
                None
            };

            let job = page
                .job_reference
                .take()
                .ok_or_else(|| ProviderError::Decode("response has no jobReference".to_string()))?;
            debug!(job_id = %job.job_id, paging = next_page.is_some(), "fetching query results");
            page = self.query_results(&token, &job, next_page.as_deref()).await?;
            if page.job_reference.is_none() {
                page.job_reference = Some(job);
            }
        }

        let records = retain_in_range(records, start, end);
        info!(records = records.len(), "fetched GCP cost rows");
        Ok(records)
    }
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, CostError> {
    value
        .as_deref()
        .ok_or_else(|| CostError::Validation(format!("Missing {name}")))
}

fn check_identifier(kind: &str, value: &str, allowed: impl Fn(char) -> bool) -> Result<(), CostError> {
    if value.is_empty() || !value.chars().all(allowed) {
        return Err(CostError::Validation(format!("invalid BigQuery {kind} identifier '{value}'")));
    }
    Ok(())
}

fn billing_sql(project: &str, dataset: &str, table: &str) -> String {
    format!(
        "SELECT DATE(usage_start_time) AS date, service.description AS service, SUM(cost) AS cost_usd \
         FROM `{project}.{dataset}.{table}` \
         WHERE DATE(_PARTITIONTIME) BETWEEN @start AND @end \
         GROUP BY date, service \
         ORDER BY date"
    )
}

fn date_param(name: &'static str, value: NaiveDate) -> QueryParameter {
    QueryParameter {
        name,
        parameter_type: ParameterType { kind: "DATE" },
        parameter_value: ParameterValue { value: value.to_string() },
    }
}

/// Positions of `date`, `service` and `cost_usd` within `f`.
#[derive(Debug, PartialEq)]
struct ColumnLayout {
    date: usize,
    service: usize,
    cost: usize,
}

impl ColumnLayout {
    fn from_schema(schema: Option<&Schema>) -> Self {
        let position = |name: &str, fallback: usize| {
            schema
                .and_then(|s| s.fields.iter().position(|f| f.name.eq_ignore_ascii_case(name)))
                .unwrap_or(fallback)
        };
        Self {
            date: position("date", 0),
            service: position("service", 1),
            cost: position("cost_usd", 2),
        }
    }

    fn record(&self, row: &Row) -> RawRecord {
        let cell = |i: usize| row.f.get(i).map(|c| &c.v);
        RawRecord {
            date: match cell(self.date) {
                Some(Value::String(s)) => RawDate::Text(s.clone()),
                Some(Value::Null) | None => RawDate::Missing,
                Some(other) => RawDate::Text(other.to_string()),
            },
            service: match cell(self.service) {
                Some(Value::String(s)) => Some(s.clone()),
                _ => None,
            },
            cost_usd: match cell(self.cost) {
                Some(Value::String(s)) => s.trim().parse().ok(),
                Some(Value::Number(n)) => n.as_f64(),
                _ => None,
            },
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    parameter_mode: &'static str,
    query_parameters: Vec<QueryParameter>,
    timeout_ms: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryParameter {
    name: &'static str,
    parameter_type: ParameterType,
    parameter_value: ParameterValue,
}

#[derive(Serialize)]
struct ParameterType {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ParameterValue {
    value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    schema: Option<Schema>,
    #[serde(default)]
    rows: Vec<Row>,
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Deserialize)]
struct Schema {
    #[serde(default)]
    fields: Vec<Field>,
}

#[derive(Deserialize)]
struct Field {
    name: String,
}

#[derive(Deserialize)]
struct Row {
    #[serde(default)]
    f: Vec<Cell>,
}

#[derive(Deserialize)]
struct Cell {
    #[serde(default)]
    v: Value,
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
}
