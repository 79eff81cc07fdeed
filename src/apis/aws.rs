use crate::apis::sigv4::{Credentials, Signer};
use crate::apis::{host_of, retain_in_range};
use crate::config::{AwsConfig, IngestionConfig};
use crate::error::{CostError, ProviderError};
use crate::infra::http_client::{build_client, read_json, retry_with_backoff, RetryPolicy};
use crate::types::{CostSource, Provider, RawDate, RawRecord};
use chrono::{Days, NaiveDate, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, instrument};

const SERVICE: &str = "ce";
const TARGET: &str = "AWSInsightsIndexService.GetCostAndUsage";
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const METRIC: &str = "UnblendedCost";

/// Cost Explorer `GetCostAndUsage`, daily, grouped by service.
pub struct AwsCostSource {
    client: reqwest::Client,
    endpoint: String,
    host: String,
    region: String,
    credentials: Credentials,
    retry: RetryPolicy,
}

impl AwsCostSource {
    pub fn new(config: &AwsConfig, ingestion: &IngestionConfig) -> Result<Self, CostError> {
        let (Some(access_key_id), Some(secret_access_key)) =
            (config.access_key_id.clone(), config.secret_access_key.clone())
        else {
            return Err(CostError::Validation(
                "Missing AWS_ACCESS_KEY_ID or AWS_SECRET_ACCESS_KEY".to_string(),
            ));
        };
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://ce.{}.amazonaws.com", config.region));
        let host = host_of(&endpoint)?;
        let client = build_client(ingestion.request_timeout())
            .map_err(|e| CostError::ingestion(Provider::Aws, e))?;

        Ok(Self {
            client,
            endpoint,
            host,
            region: config.region.clone(),
            credentials: Credentials {
                access_key_id,
                secret_access_key,
                session_token: config.session_token.clone(),
            },
            retry: ingestion.retry_policy(),
        })
    }

    async fn post_page(&self, body: &[u8]) -> Result<CostAndUsageResponse, ProviderError> {
        let signer = Signer {
            credentials: &self.credentials,
            region: &self.region,
            service: SERVICE,
        };
        let signed = signer.sign_post(
            &self.host,
            &[("content-type", CONTENT_TYPE), ("x-amz-target", TARGET)],
            body,
            Utc::now(),
        );

        let mut req = self.client.post(&self.endpoint).body(body.to_vec());
        for (name, value) in &signed.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        read_json(req.send().await?).await
    }
}

#[async_trait::async_trait]
impl CostSource for AwsCostSource {
    fn provider(&self) -> Provider {
        Provider::Aws
    }

    #[instrument(skip(self))]
    async fn fetch(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<RawRecord>, ProviderError> {
        // Cost Explorer's end date is exclusive
        let exclusive_end = end
            .checked_add_days(Days::new(1))
            .ok_or_else(|| ProviderError::Decode(format!("end date {end} out of range")))?;

        let mut results = Vec::new();
        let mut token: Option<String> = None;
        let mut pages = 0u32;

        loop {
            let request = CostAndUsageRequest {
                time_period: TimePeriod {
                    start: start.to_string(),
                    end: exclusive_end.to_string(),
                },
                granularity: "DAILY",
                metrics: [METRIC],
                group_by: [GroupDefinition { kind: "DIMENSION", key: "SERVICE" }],
                next_page_token: token.as_deref(),
            };
            let body = serde_json::to_vec(&request).map_err(|e| ProviderError::Decode(e.to_string()))?;

            let body = body.as_slice();
            let page =
                retry_with_backoff(self.retry, "aws.get_cost_and_usage", move || self.post_page(body)).await?;
            pages += 1;
            counter!("finops_provider_pages_total", "provider" => "aws").increment(1);

            for day in page.results_by_time {
                for group in day.groups {
                    let cost_usd = group
                        .metrics
                        .get(METRIC)
                        .and_then(|m| m.amount.as_deref())
                        .and_then(|a| a.parse::<f64>().ok());
                    results.push(RawRecord {
                        date: RawDate::Text(day.time_period.start.clone()),
                        service: group.keys.into_iter().next(),
                        cost_usd,
                    });
                }
            }

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) if token.as_deref() == Some(next.as_str()) => {
                    return Err(ProviderError::Decode(format!("pagination token '{next}' repeated")));
                }
                Some(next) => {
                    debug!(pages, "following NextPageToken");
                    token = Some(next);
                }
                None => break,
            }
        }

        let results = retain_in_range(results, start, end);
        info!(pages, records = results.len(), "fetched AWS cost rows");
        Ok(results)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CostAndUsageRequest<'a> {
    time_period: TimePeriod,
    granularity: &'a str,
    metrics: [&'a str; 1],
    group_by: [GroupDefinition<'a>; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    next_page_token: Option<&'a str>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TimePeriod {
    start: String,
    end: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct GroupDefinition<'a> {
    #[serde(rename = "Type")]
    kind: &'a str,
    key: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CostAndUsageResponse {
    #[serde(default)]
    results_by_time: Vec<ResultByTime>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResultByTime {
    time_period: TimePeriod,
    #[serde(default)]
    groups: Vec<Group>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Group {
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default)]
    metrics: HashMap<String, MetricValue>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MetricValue {
    amount: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credentials_is_a_validation_failure() {
        let err = AwsCostSource::new(&AwsConfig::default(), &IngestionConfig::default()).err().unwrap();
        assert!(matches!(err, CostError::Validation(_)));
    }

    #[test]
    fn request_uses_pascal_case_and_omits_empty_token() {
        let request = CostAndUsageRequest {
            time_period: TimePeriod { start: "2025-01-01".into(), end: "2025-01-04".into() },
            granularity: "DAILY",
            metrics: [METRIC],
            group_by: [GroupDefinition { kind: "DIMENSION", key: "SERVICE" }],
            next_page_token: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["TimePeriod"]["End"], "2025-01-04");
        assert_eq!(json["GroupBy"][0]["Type"], "DIMENSION");
        assert_eq!(json["Metrics"][0], "UnblendedCost");
        assert!(json.get("NextPageToken").is_none());
    }

    #[test]
    fn response_tolerates_missing_groups() {
        let page: CostAndUsageResponse = serde_json::from_str(
            r#"{"ResultsByTime":[{"TimePeriod":{"Start":"2025-01-01","End":"2025-01-02"},"Total":{}}]}"#,
        )
        .unwrap();
        assert!(page.results_by_time[0].groups.is_empty());
        assert!(page.next_page_token.is_none());
    }
}
