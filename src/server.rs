use crate::apis::{ConfigSourceFactory, SourceFactory};
use crate::config::{Config, StoreNames};
use crate::constants::{get_supported_apis, SERVICE_NAME};
use crate::error::{CostError, Result};
use crate::pipeline::{self, IngestRequest, IngestSummary};
use crate::query::{CostFilter, CostQuery, CostSummary, ProviderCost};
use crate::storage::CsvStore;
use crate::types::Provider;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::NaiveDate;
use hyper::Server;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub query: Arc<CostQuery>,
    pub store: Arc<CsvStore>,
    pub factory: Arc<dyn SourceFactory>,
    pub names: StoreNames,
    pub fetch_timeout: Duration,
}

impl AppState {
    pub fn new(
        store: Arc<CsvStore>,
        factory: Arc<dyn SourceFactory>,
        names: StoreNames,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            query: Arc::new(CostQuery::new(store.clone(), names.clone())),
            store,
            factory,
            names,
            fetch_timeout,
        }
    }

    /// State for a configured deployment; the data directory must exist.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = Arc::new(CsvStore::open_existing(&config.storage.data_dir)?);
        Ok(Self::new(
            store,
            Arc::new(ConfigSourceFactory::new(config.clone())),
            config.storage.stores.clone(),
            config.ingestion.fetch_timeout(),
        ))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for CostError {
    fn into_response(self) -> Response {
        let status = match &self {
            CostError::Validation(_) => StatusCode::BAD_REQUEST,
            CostError::NotFound(_) => StatusCode::NOT_FOUND,
            CostError::Ingestion { .. } => StatusCode::BAD_GATEWAY,
            CostError::DataIntegrity { .. }
            | CostError::Config(_)
            | CostError::Io(_)
            | CostError::Csv(_)
            | CostError::Json(_)
            | CostError::Toml(_)
            | CostError::Blocking(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "request rejected");
        }
        (status, Json(ErrorBody { detail: self.to_string() })).into_response()
    }
}

/// Query-string filters as received. Empty values mean "no filter".
#[derive(Debug, Default, Deserialize)]
pub struct CostParams {
    pub service: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub provider: Option<String>,
}

impl CostParams {
    fn into_filter(self) -> Result<CostFilter> {
        Ok(CostFilter {
            service: non_empty(self.service),
            start_date: non_empty(self.start_date).map(|s| parse_date("start_date", &s)).transpose()?,
            end_date: non_empty(self.end_date).map(|s| parse_date("end_date", &s)).transpose()?,
            provider: non_empty(self.provider)
                .map(|p| p.parse::<Provider>().map_err(CostError::Validation))
                .transpose()?,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_date(field: &str, value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| CostError::Validation(format!("{field} must be YYYY-MM-DD, got '{value}'")))
}

/// One cost row on the wire.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct CostItem {
    pub provider: Provider,
    pub date: NaiveDate,
    pub service: Option<String>,
    pub cost_usd: f64,
}

impl From<ProviderCost> for CostItem {
    fn from(cost: ProviderCost) -> Self {
        Self {
            provider: cost.provider,
            date: cost.row.date,
            service: cost.row.service,
            cost_usd: cost.row.cost_usd,
        }
    }
}

/// Run a store read on the blocking pool, off the async workers.
async fn on_store<T, F>(state: &AppState, read: F) -> Result<T>
where
    F: FnOnce(&CostQuery) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let query = state.query.clone();
    tokio::task::spawn_blocking(move || read(&query)).await?
}

async fn root() -> impl IntoResponse {
    Json(serde_json::json!({ "message": format!("Welcome to the {SERVICE_NAME}") }))
}

/// Health check endpoint
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::render(),
    )
}

async fn api_info() -> impl IntoResponse {
    let per_provider: Vec<String> = get_supported_apis()
        .into_iter()
        .map(|api| format!("/api/v1/costs/{api}"))
        .collect();
    Json(serde_json::json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "costs": "/api/v1/costs",
            "summary": "/api/v1/costs/summary",
            "providers": per_provider,
            "ingestion": "/api/v1/ingestion",
        },
        "status": "operational"
    }))
}

async fn all_costs(
    State(state): State<AppState>,
    Query(params): Query<CostParams>,
) -> Result<Json<Vec<CostItem>>> {
    let filter = params.into_filter()?;
    let rows = on_store(&state, move |query| query.fetch_all_costs(&filter)).await?;
    Ok(Json(rows.into_iter().map(CostItem::from).collect()))
}

async fn cost_summary(
    State(state): State<AppState>,
    Query(params): Query<CostParams>,
) -> Result<Json<CostSummary>> {
    let filter = params.into_filter()?;
    Ok(Json(on_store(&state, move |query| query.summarize(&filter)).await?))
}

async fn provider_costs(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<CostParams>,
) -> Result<Json<Vec<CostItem>>> {
    let provider: Provider = provider
        .parse()
        .map_err(|_| CostError::NotFound(format!("Unknown provider '{provider}'")))?;
    let filter = CostFilter { provider: None, ..params.into_filter()? };
    let rows = on_store(&state, move |query| query.fetch_costs(provider, &filter)).await?;
    if rows.is_empty() {
        return Err(CostError::NotFound(format!(
            "No {provider} cost data found for the specified filters"
        )));
    }
    Ok(Json(rows.into_iter().map(CostItem::from).collect()))
}

async fn trigger_ingestion(
    State(state): State<AppState>,
    body: std::result::Result<Json<IngestRequest>, JsonRejection>,
) -> Result<Json<IngestSummary>> {
    let Json(request) = body.map_err(|e| CostError::Validation(e.body_text()))?;
    info!(start = %request.start, end = %request.end, "ingestion triggered over HTTP");
    let summary = pipeline::ingest(
        state.factory.as_ref(),
        state.store.clone(),
        &state.names,
        &request,
        state.fetch_timeout,
    )
    .await?;
    Ok(Json(summary))
}

/// Create the HTTP router with all routes.
pub fn create_server(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/v1", get(api_info))
        .route("/api/v1/costs", get(all_costs))
        .route("/api/v1/costs/summary", get(cost_summary))
        .route("/api/v1/costs/:provider", get(provider_costs))
        .route("/api/v1/ingestion", post(trigger_ingestion))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(cors))
}

/// Start the HTTP server on the specified port; stops on Ctrl-C.
pub async fn start_server(state: AppState, port: u16) -> anyhow::Result<()> {
    let app = create_server(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("HTTP server running on http://localhost:{port}");
    info!("Health check: http://localhost:{port}/health");

    Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
