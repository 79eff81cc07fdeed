//! Adapters against local stand-ins for the provider billing APIs.

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::NaiveDate;
use finops_costs::apis::{aws::AwsCostSource, azure::AzureCostSource, gcp::GcpCostSource};
use finops_costs::config::{AwsConfig, AzureConfig, GcpConfig, IngestionConfig};
use finops_costs::error::ProviderError;
use finops_costs::types::{CostSource, RawDate};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

async fn spawn(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    format!("http://{addr}")
}

fn fast_ingestion() -> IngestionConfig {
    IngestionConfig {
        request_timeout_secs: 5,
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
        max_result_polls: 5,
        ..IngestionConfig::default()
    }
}

fn jan(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
}

#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<AtomicU32>,
    bodies: Arc<Mutex<Vec<Value>>>,
}

async fn cost_explorer(State(rec): State<Recorder>, headers: HeaderMap, body: String) -> impl IntoResponse {
    let call = rec.calls.fetch_add(1, Ordering::SeqCst);
    let target = headers.get("x-amz-target").and_then(|v| v.to_str().ok()).unwrap_or_default();
    let auth = headers.get("authorization").and_then(|v| v.to_str().ok()).unwrap_or_default();
    if target != "AWSInsightsIndexService.GetCostAndUsage" || !auth.starts_with("AWS4-HMAC-SHA256 ") {
        return (StatusCode::BAD_REQUEST, Json(json!({"message": "unsigned"})));
    }
    if call == 0 {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"message": "try again"})));
    }

    let request: Value = serde_json::from_str(&body).unwrap();
    rec.bodies.lock().unwrap().push(request.clone());
    let page = match request.get("NextPageToken").and_then(Value::as_str) {
        None => json!({
            "ResultsByTime": [{
                "TimePeriod": {"Start": "2025-01-01", "End": "2025-01-02"},
                "Groups": [
                    {"Keys": ["Amazon Elastic Compute Cloud - Compute"], "Metrics": {"UnblendedCost": {"Amount": "12.5", "Unit": "USD"}}},
                    {"Keys": ["Tax"], "Metrics": {"UnblendedCost": {"Amount": "-0.25", "Unit": "USD"}}}
                ]
            }],
            "NextPageToken": "page-2"
        }),
        Some("page-2") => json!({
            "ResultsByTime": [{
                "TimePeriod": {"Start": "2025-01-02", "End": "2025-01-03"},
                "Groups": [
                    {"Keys": ["Amazon Simple Storage Service"], "Metrics": {"UnblendedCost": {"Amount": "3", "Unit": "USD"}}}
                ]
            }]
        }),
        Some(other) => panic!("unexpected token {other}"),
    };
    (StatusCode::OK, Json(page))
}

#[tokio::test]
async fn test_aws_follows_pages_and_retries_throttling() -> Result<()> {
    let rec = Recorder::default();
    let base = spawn(Router::new().route("/", post(cost_explorer)).with_state(rec.clone())).await;

    let config = AwsConfig {
        endpoint: Some(base),
        access_key_id: Some("AKIDEXAMPLE".into()),
        secret_access_key: Some("secret".into()),
        ..AwsConfig::default()
    };
    let source = AwsCostSource::new(&config, &fast_ingestion())?;
    let rows = source.fetch(jan(1), jan(2)).await?;

    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].date, RawDate::Text("2025-01-01".into()));
    assert_eq!(rows[0].cost_usd, Some(12.5));
    assert_eq!(rows[1].cost_usd, Some(-0.25));
    assert_eq!(rows[2].service.as_deref(), Some("Amazon Simple Storage Service"));

    // one throttled attempt, then two pages
    assert_eq!(rec.calls.load(Ordering::SeqCst), 3);
    let bodies = rec.bodies.lock().unwrap();
    assert_eq!(bodies[0]["TimePeriod"]["End"], "2025-01-03");
    assert_eq!(bodies[0]["Granularity"], "DAILY");
    assert_eq!(bodies[1]["NextPageToken"], "page-2");
    Ok(())
}

#[tokio::test]
async fn test_aws_rejected_credentials_are_not_retried() -> Result<()> {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let app = Router::new().route(
        "/",
        post(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                (StatusCode::FORBIDDEN, r#"{"__type":"UnrecognizedClientException"}"#)
            }
        }),
    );
    let base = spawn(app).await;

    let config = AwsConfig {
        endpoint: Some(base),
        access_key_id: Some("AKIDEXAMPLE".into()),
        secret_access_key: Some("wrong".into()),
        ..AwsConfig::default()
    };
    let err = AwsCostSource::new(&config, &fast_ingestion())?
        .fetch(jan(1), jan(2))
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Auth(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

async fn azure_token(body: String) -> impl IntoResponse {
    if body.contains("grant_type=client_credentials") && body.contains("client_id=app-1") {
        (StatusCode::OK, Json(json!({"token_type": "Bearer", "access_token": "issued-token"})))
    } else {
        (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid_client"})))
    }
}

async fn azure_query(
    State(rec): State<Recorder>,
    Path(subscription): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    rec.calls.fetch_add(1, Ordering::SeqCst);
    let auth = headers.get("authorization").and_then(|v| v.to_str().ok());
    if auth != Some("Bearer issued-token") {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "no token"})));
    }
    assert_eq!(subscription, "sub-1");
    assert_eq!(params.get("api-version").map(String::as_str), Some("2023-03-01"));
    rec.bodies.lock().unwrap().push(body);

    (
        StatusCode::OK,
        Json(json!({
            "properties": {
                "nextLink": null,
                "columns": [
                    {"name": "Cost", "type": "Number"},
                    {"name": "UsageDate", "type": "Number"},
                    {"name": "ServiceName", "type": "String"},
                    {"name": "Currency", "type": "String"}
                ],
                "rows": [
                    [4.2, 20250101, "Storage", "USD"],
                    [1.1, 20250102, "Virtual Machines", "USD"]
                ]
            }
        })),
    )
}

#[tokio::test]
async fn test_azure_client_credentials_and_named_columns() -> Result<()> {
    let rec = Recorder::default();
    let app = Router::new()
        .route("/tenant-1/oauth2/v2.0/token", post(azure_token))
        .route(
            "/subscriptions/:subscription/providers/Microsoft.CostManagement/query",
            post(azure_query),
        )
        .with_state(rec.clone());
    let base = spawn(app).await;

    let config = AzureConfig {
        subscription_id: Some("sub-1".into()),
        tenant_id: Some("tenant-1".into()),
        client_id: Some("app-1".into()),
        client_secret: Some("s3cret".into()),
        management_endpoint: base.clone(),
        login_endpoint: base,
        ..AzureConfig::default()
    };
    let rows = AzureCostSource::new(&config, &fast_ingestion())?.fetch(jan(1), jan(2)).await?;

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].date, RawDate::Numeric(20250101));
    assert_eq!(rows[0].service.as_deref(), Some("Storage"));
    assert_eq!(rows[0].cost_usd, Some(4.2));

    let bodies = rec.bodies.lock().unwrap();
    assert_eq!(bodies[0]["timePeriod"]["to"], "2025-01-02T23:59:59Z");
    assert_eq!(bodies[0]["dataset"]["granularity"], "Daily");
    Ok(())
}

#[tokio::test]
async fn test_azure_empty_rows_is_not_an_error() -> Result<()> {
    let app = Router::new().route(
        "/subscriptions/sub-1/providers/Microsoft.CostManagement/query",
        post(|| async { Json(json!({"properties": {"columns": [], "rows": []}})) }),
    );
    let base = spawn(app).await;

    let config = AzureConfig {
        subscription_id: Some("sub-1".into()),
        access_token: Some("static".into()),
        management_endpoint: base,
        ..AzureConfig::default()
    };
    let rows = AzureCostSource::new(&config, &fast_ingestion())?.fetch(jan(1), jan(31)).await?;
    assert!(rows.is_empty());
    Ok(())
}

async fn bigquery_query(State(rec): State<Recorder>, Json(body): Json<Value>) -> impl IntoResponse {
    rec.calls.fetch_add(1, Ordering::SeqCst);
    rec.bodies.lock().unwrap().push(body);
    Json(json!({
        "kind": "bigquery#queryResponse",
        "jobComplete": false,
        "jobReference": {"projectId": "acme", "jobId": "job-1", "location": "US"}
    }))
}

async fn bigquery_results(
    State(rec): State<Recorder>,
    Path(job): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    rec.calls.fetch_add(1, Ordering::SeqCst);
    assert_eq!(job, "job-1");
    assert_eq!(params.get("location").map(String::as_str), Some("US"));
    let schema = json!({"fields": [
        {"name": "date", "type": "DATE"},
        {"name": "service", "type": "STRING"},
        {"name": "cost_usd", "type": "FLOAT"}
    ]});
    match params.get("pageToken").map(String::as_str) {
        None => Json(json!({
            "jobComplete": true,
            "jobReference": {"projectId": "acme", "jobId": "job-1", "location": "US"},
            "schema": schema,
            "rows": [{"f": [{"v": "2025-01-01"}, {"v": "Compute Engine"}, {"v": "7.5"}]}],
            "pageToken": "next"
        })),
        Some(_) => Json(json!({
            "jobComplete": true,
            "jobReference": {"projectId": "acme", "jobId": "job-1", "location": "US"},
            "schema": schema,
            "rows": [
                {"f": [{"v": "2025-01-02"}, {"v": "Cloud Storage"}, {"v": "0.5"}]},
                {"f": [{"v": "2025-01-03"}, {"v": "Cloud Storage"}, {"v": "9.0"}]}
            ]
        })),
    }
}

#[tokio::test]
async fn test_gcp_polls_job_and_follows_page_tokens() -> Result<()> {
    let rec = Recorder::default();
    let app = Router::new()
        .route("/bigquery/v2/projects/acme/queries", post(bigquery_query))
        .route("/bigquery/v2/projects/acme/queries/:job", get(bigquery_results))
        .with_state(rec.clone());
    let base = spawn(app).await;

    let rows = GcpCostSource::new(&gcp_config(base), &fast_ingestion())?.fetch(jan(1), jan(2)).await?;

    // the 2025-01-03 row lies past the requested end and is dropped
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.date != RawDate::Text("2025-01-03".into())));
    assert_eq!(rows[0].service.as_deref(), Some("Compute Engine"));
    assert_eq!(rows[1].date, RawDate::Text("2025-01-02".into()));
    assert_eq!(rows[1].cost_usd, Some(0.5));
    assert_eq!(rec.calls.load(Ordering::SeqCst), 3);

    let bodies = rec.bodies.lock().unwrap();
    let sent = &bodies[0];
    assert_eq!(sent["parameterMode"], "NAMED");
    assert_eq!(sent["queryParameters"][1]["name"], "end");
    assert_eq!(sent["queryParameters"][1]["parameterValue"]["value"], "2025-01-02");
    assert!(!sent["query"].as_str().unwrap().contains("2025-01"));
    Ok(())
}

async fn bigquery_paged_results(
    State(rec): State<Recorder>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    rec.calls.fetch_add(1, Ordering::SeqCst);
    let page: u32 = params.get("pageToken").and_then(|t| t.parse().ok()).unwrap_or(1);
    let mut body = json!({
        "jobComplete": true,
        "jobReference": {"projectId": "acme", "jobId": "job-1", "location": "US"},
        "schema": {"fields": [
            {"name": "date", "type": "DATE"},
            {"name": "service", "type": "STRING"},
            {"name": "cost_usd", "type": "FLOAT"}
        ]},
        "rows": [{"f": [{"v": format!("2025-01-0{page}")}, {"v": "BigQuery"}, {"v": "1.0"}]}]
    });
    if page < 4 {
        body["pageToken"] = json!((page + 1).to_string());
    }
    Json(body)
}

async fn bigquery_pending(State(rec): State<Recorder>) -> impl IntoResponse {
    rec.calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "jobComplete": false,
        "jobReference": {"projectId": "acme", "jobId": "job-1", "location": "US"}
    }))
}

fn gcp_config(endpoint: String) -> GcpConfig {
    GcpConfig {
        project_id: Some("acme".into()),
        dataset: Some("billing".into()),
        table: Some("gcp_billing_export".into()),
        access_token: Some("ya29.token".into()),
        endpoint,
        ..GcpConfig::default()
    }
}

#[tokio::test]
async fn test_gcp_result_pages_do_not_use_up_the_poll_budget() -> Result<()> {
    let rec = Recorder::default();
    let app = Router::new()
        .route("/bigquery/v2/projects/acme/queries", post(bigquery_query))
        .route("/bigquery/v2/projects/acme/queries/:job", get(bigquery_paged_results))
        .with_state(rec.clone());
    let base = spawn(app).await;

    let ingestion = IngestionConfig { max_result_polls: 1, ..fast_ingestion() };
    let rows = GcpCostSource::new(&gcp_config(base), &ingestion)?.fetch(jan(1), jan(31)).await?;

    assert_eq!(rows.len(), 4);
    assert_eq!(rows[3].date, RawDate::Text("2025-01-04".into()));
    assert_eq!(rec.calls.load(Ordering::SeqCst), 5);
    Ok(())
}

#[tokio::test]
async fn test_gcp_job_that_never_completes_gives_up() -> Result<()> {
    let rec = Recorder::default();
    let app = Router::new()
        .route("/bigquery/v2/projects/acme/queries", post(bigquery_pending))
        .route("/bigquery/v2/projects/acme/queries/:job", get(bigquery_pending))
        .with_state(rec.clone());
    let base = spawn(app).await;

    let ingestion = IngestionConfig { max_result_polls: 2, ..fast_ingestion() };
    let err = GcpCostSource::new(&gcp_config(base), &ingestion)?
        .fetch(jan(1), jan(31))
        .await
        .unwrap_err();

    assert!(matches!(&err, ProviderError::Decode(msg) if msg.contains("still pending")), "{err}");
    // the initial query plus two polls
    assert_eq!(rec.calls.load(Ordering::SeqCst), 3);
    Ok(())
}
