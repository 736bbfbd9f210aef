use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use gateway_observer_core::{
    IngestReport, Observer, ObserverError, Signal, SignalThresholds, StatusSummary, TailPage,
    ThreadDetail, ThreadSummary,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

const SERVICE_CONTRACT_VERSION: &str = "observer.v1";

#[derive(Clone)]
struct ServiceState {
    observer: Arc<Observer>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: String,
    message: String,
    details: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    event_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
struct TailParams {
    after_event_id: Option<u64>,
    limit: Option<usize>,
}

#[derive(Debug, Parser)]
#[command(name = "gateway-observer-service")]
#[command(about = "Observation-only HTTP surface over a decision gateway")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:8020")]
    bind: SocketAddr,
    /// Base URL of the upstream gateway; enables the in-process polling loop.
    #[arg(long)]
    gateway_url: Option<String>,
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,
    #[arg(long, default_value_t = 200)]
    page_limit: usize,
    /// JSON document overriding signal thresholds; absent fields keep their
    /// defaults.
    #[arg(long)]
    thresholds_json: Option<String>,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceFailure {
    fn from_observer(err: &ObserverError) -> Self {
        let status = match err {
            ObserverError::NotFound(_) => StatusCode::NOT_FOUND,
            ObserverError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
            details: None,
        }
    }

    fn invalid_json(rejection: &JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            code: "invalid_input".to_string(),
            message: rejection.body_text(),
            details: None,
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        contract_version: SERVICE_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/ingest", post(ingest))
        .route("/v1/status", get(status))
        .route("/v1/threads", get(threads))
        .route("/v1/threads/:thread_id", get(thread))
        .route("/v1/signals", get(signals))
        .route("/v1/tail", get(tail))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let thresholds = match &args.thresholds_json {
        Some(text) => SignalThresholds::from_json(&serde_json::from_str(text)?)?,
        None => SignalThresholds::default(),
    };
    let observer = Arc::new(Observer::new(thresholds));

    if let Some(gateway_url) = args.gateway_url.clone() {
        let poller = Arc::clone(&observer);
        let interval = Duration::from_millis(args.poll_interval_ms);
        let page_limit = args.page_limit;
        tokio::spawn(async move {
            poll_gateway(poller, gateway_url, interval, page_limit).await;
        });
    }

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "gateway-observer-service listening");
    axum::serve(listener, app(ServiceState { observer })).await?;
    Ok(())
}

// Fetches snapshot envelopes from the gateway and drives ingest, advancing
// the offset by the accepted count. A rejected item stalls the stream at the
// accepted prefix: the observer never skips or reorders gateway events.
async fn poll_gateway(
    observer: Arc<Observer>,
    base_url: String,
    interval: Duration,
    page_limit: usize,
) {
    let client = reqwest::Client::new();
    let mut offset: usize = 0;
    loop {
        match fetch_snapshot(&client, &base_url, offset, page_limit).await {
            Ok(snapshot) => match observer.ingest(&snapshot) {
                Ok(report) => {
                    offset += report.accepted;
                    if let Some(reason) = &report.reason {
                        warn!(offset, reason = reason.as_str(), "gateway batch halted");
                    } else if report.accepted > 0 {
                        info!(offset, accepted = report.accepted, "gateway batch ingested");
                    }
                    if report.accepted == 0 {
                        tokio::time::sleep(interval).await;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "gateway envelope rejected");
                    tokio::time::sleep(interval).await;
                }
            },
            Err(err) => {
                warn!(error = %err, "gateway snapshot fetch failed");
                tokio::time::sleep(interval).await;
            }
        }
    }
}

async fn fetch_snapshot(
    client: &reqwest::Client,
    base_url: &str,
    offset: usize,
    limit: usize,
) -> Result<Value> {
    let url = format!(
        "{}/snapshot?offset={offset}&limit={limit}",
        base_url.trim_end_matches('/')
    );
    let response = client.get(&url).send().await?.error_for_status()?;
    Ok(response.json().await?)
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse {
        status: "ok",
        event_count: state.observer.store().size(),
    }))
}

async fn ingest(
    State(state): State<ServiceState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<IngestReport>>, ServiceFailure> {
    let Json(snapshot) = payload.map_err(|rejection| ServiceFailure::invalid_json(&rejection))?;
    let report = state
        .observer
        .ingest(&snapshot)
        .map_err(|err| ServiceFailure::from_observer(&err))?;

    if let Some(rejected_at) = report.rejected_at {
        let code = report
            .reason
            .clone()
            .unwrap_or_else(|| "invalid_input".to_string());
        warn!(rejected_at, code = code.as_str(), "ingest batch halted");
        return Err(ServiceFailure {
            status: StatusCode::BAD_REQUEST,
            code,
            message: format!("ingest halted at item {rejected_at}"),
            details: serde_json::to_value(&report).ok(),
        });
    }
    info!(accepted = report.accepted, "ingest batch accepted");
    Ok(Json(envelope(report)))
}

async fn status(State(state): State<ServiceState>) -> Json<ServiceEnvelope<StatusSummary>> {
    Json(envelope(state.observer.status()))
}

async fn threads(State(state): State<ServiceState>) -> Json<ServiceEnvelope<Vec<ThreadSummary>>> {
    Json(envelope(state.observer.threads()))
}

async fn thread(
    State(state): State<ServiceState>,
    Path(thread_id): Path<String>,
) -> Result<Json<ServiceEnvelope<ThreadDetail>>, ServiceFailure> {
    let detail = state
        .observer
        .thread(&thread_id)
        .map_err(|err| ServiceFailure::from_observer(&err))?;
    Ok(Json(envelope(detail)))
}

async fn signals(State(state): State<ServiceState>) -> Json<ServiceEnvelope<Vec<Signal>>> {
    Json(envelope(state.observer.signals()))
}

async fn tail(
    State(state): State<ServiceState>,
    Query(params): Query<TailParams>,
) -> Json<ServiceEnvelope<TailPage>> {
    Json(envelope(
        state.observer.tail(params.after_event_id, params.limit),
    ))
}
