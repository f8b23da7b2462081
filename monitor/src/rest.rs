use crate::alerts::AlertStats;
use crate::analytics::{AnalysisReport, CorrelationReport, SensorRef};
use crate::context::{Monitor, SystemStats};
use crate::errors::Error;
use crate::metrics;
use crate::model::{Alert, AlertStatus, Device, Sensor, SensorSample};
use crate::store::{AggregationFn, Bucket, Granularity};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, warn};

type AppState = Arc<Monitor>;

/// Analysis window; defaults to the last hour.
#[derive(Debug, Deserialize)]
pub struct TimeRange {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl TimeRange {
    fn resolve(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let end = self.end.unwrap_or_else(Utc::now);
        let start = self.start.unwrap_or(end - Duration::hours(1));
        (start, end)
    }
}

#[derive(Debug, Deserialize)]
pub struct AggregateQuery {
    #[serde(flatten)]
    range: TimeRange,
    granularity: Option<String>,
    aggregation: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CorrelationQuery {
    device1: String,
    sensor1: String,
    device2: String,
    sensor2: String,
    #[serde(flatten)]
    range: TimeRange,
}

#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    /// Comma separated statuses; all alerts when absent.
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EnabledBody {
    enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    data: Vec<T>,
    total: usize,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(data: Vec<T>) -> Self {
        Self {
            total: data.len(),
            data,
        }
    }
}

pub fn create_router(monitor: Arc<Monitor>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/devices", get(list_devices).post(register_device))
        .route(
            "/api/v1/devices/:device_id",
            get(get_device).put(update_device).delete(delete_device),
        )
        .route(
            "/api/v1/devices/:device_id/sensors",
            get(list_sensors).post(add_sensor),
        )
        .route(
            "/api/v1/devices/:device_id/sensors/:sensor_id",
            get(get_sensor).delete(remove_sensor),
        )
        .route(
            "/api/v1/devices/:device_id/sensors/:sensor_id/enabled",
            put(set_sensor_enabled),
        )
        .route("/api/v1/sensors", get(list_all_sensors))
        .route("/api/v1/data", post(submit_sample))
        .route("/api/v1/alerts", get(list_alerts).post(add_alert))
        .route("/api/v1/alerts/stats", get(alert_stats))
        .route("/api/v1/alerts/:alert_id", get(get_alert))
        .route("/api/v1/alerts/:alert_id/resolve", post(resolve_alert))
        .route("/api/v1/alerts/:alert_id/suppress", post(suppress_alert))
        .route("/api/v1/analytics/correlation", get(correlation))
        .route("/api/v1/analytics/:device_id/:sensor_id", get(analyze))
        .route(
            "/api/v1/analytics/:device_id/:sensor_id/aggregate",
            get(aggregate),
        )
        .route("/api/v1/stats", get(system_stats))
        .with_state(monitor)
}

async fn health(State(monitor): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "pipeline_running": monitor.pipeline.is_running(),
        "timestamp": Utc::now(),
    }))
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

async fn list_devices(State(monitor): State<AppState>) -> Json<ListResponse<Device>> {
    Json(monitor.registry.get_all_devices().into())
}

async fn register_device(
    State(monitor): State<AppState>,
    Json(device): Json<Device>,
) -> Result<(StatusCode, Json<Device>), AppError> {
    let device = monitor.registry.register_device(device)?;
    Ok((StatusCode::CREATED, Json(device)))
}

async fn get_device(
    State(monitor): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<Device>, AppError> {
    Ok(Json(monitor.registry.get_device(&device_id)?))
}

async fn update_device(
    State(monitor): State<AppState>,
    Path(device_id): Path<String>,
    Json(mut device): Json<Device>,
) -> Result<Json<Device>, AppError> {
    device.id = device_id;
    Ok(Json(monitor.registry.update_device(device)?))
}

async fn delete_device(
    State(monitor): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<StatusCode, AppError> {
    monitor.registry.delete_device(&device_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_sensors(
    State(monitor): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<ListResponse<Sensor>>, AppError> {
    Ok(Json(monitor.registry.get_device(&device_id)?.sensors.into()))
}

async fn list_all_sensors(State(monitor): State<AppState>) -> Json<ListResponse<Sensor>> {
    Json(monitor.registry.get_all_sensors().into())
}

async fn add_sensor(
    State(monitor): State<AppState>,
    Path(device_id): Path<String>,
    Json(sensor): Json<Sensor>,
) -> Result<(StatusCode, Json<Sensor>), AppError> {
    let sensor = monitor.registry.add_sensor(&device_id, sensor)?;
    Ok((StatusCode::CREATED, Json(sensor)))
}

async fn get_sensor(
    State(monitor): State<AppState>,
    Path((device_id, sensor_id)): Path<(String, String)>,
) -> Result<Json<Sensor>, AppError> {
    Ok(Json(monitor.registry.get_sensor(&device_id, &sensor_id)?))
}

async fn remove_sensor(
    State(monitor): State<AppState>,
    Path((device_id, sensor_id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    monitor.registry.remove_sensor(&device_id, &sensor_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_sensor_enabled(
    State(monitor): State<AppState>,
    Path((device_id, sensor_id)): Path<(String, String)>,
    Json(body): Json<EnabledBody>,
) -> Result<Json<Sensor>, AppError> {
    monitor
        .registry
        .set_sensor_enabled(&device_id, &sensor_id, body.enabled)?;
    Ok(Json(monitor.registry.get_sensor(&device_id, &sensor_id)?))
}

async fn submit_sample(
    State(monitor): State<AppState>,
    Json(sample): Json<SensorSample>,
) -> Result<StatusCode, AppError> {
    monitor.pipeline.process_sensor_data(sample).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn list_alerts(
    State(monitor): State<AppState>,
    Query(params): Query<AlertQuery>,
) -> Result<Json<ListResponse<Alert>>, AppError> {
    let statuses = match params.status.as_deref() {
        Some(raw) => raw
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(str::parse::<AlertStatus>)
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };
    let mut alerts = monitor.alerts.get_alerts(&statuses);
    alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(Json(alerts.into()))
}

async fn add_alert(
    State(monitor): State<AppState>,
    Json(alert): Json<Alert>,
) -> Result<(StatusCode, Json<Alert>), AppError> {
    let alert = monitor.alerts.add_alert(alert)?;
    Ok((StatusCode::CREATED, Json(alert)))
}

async fn alert_stats(State(monitor): State<AppState>) -> Json<AlertStats> {
    Json(monitor.alerts.alert_stats())
}

async fn get_alert(
    State(monitor): State<AppState>,
    Path(alert_id): Path<String>,
) -> Result<Json<Alert>, AppError> {
    Ok(Json(monitor.alerts.get_alert(&alert_id)?))
}

async fn resolve_alert(
    State(monitor): State<AppState>,
    Path(alert_id): Path<String>,
) -> Result<Json<Alert>, AppError> {
    Ok(Json(monitor.alerts.resolve_alert(&alert_id)?))
}

async fn suppress_alert(
    State(monitor): State<AppState>,
    Path(alert_id): Path<String>,
) -> Result<Json<Alert>, AppError> {
    Ok(Json(monitor.alerts.suppress_alert(&alert_id)?))
}

async fn analyze(
    State(monitor): State<AppState>,
    Path((device_id, sensor_id)): Path<(String, String)>,
    Query(range): Query<TimeRange>,
) -> Result<Json<AnalysisReport>, AppError> {
    let (start, end) = range.resolve();
    let report = monitor
        .analytics
        .analyze_sensor_data(&device_id, &sensor_id, start, end)
        .await?;
    Ok(Json(report))
}

async fn aggregate(
    State(monitor): State<AppState>,
    Path((device_id, sensor_id)): Path<(String, String)>,
    Query(params): Query<AggregateQuery>,
) -> Result<Json<ListResponse<Bucket>>, AppError> {
    let granularity: Granularity = params.granularity.as_deref().unwrap_or("minute").parse()?;
    let aggregation: AggregationFn = params.aggregation.as_deref().unwrap_or("avg").parse()?;
    let (start, end) = params.range.resolve();
    let buckets = monitor
        .analytics
        .aggregate_sensor_data(&device_id, &sensor_id, start, end, granularity, aggregation)
        .await?;
    Ok(Json(buckets.into()))
}

async fn correlation(
    State(monitor): State<AppState>,
    Query(params): Query<CorrelationQuery>,
) -> Result<Json<CorrelationReport>, AppError> {
    let (start, end) = params.range.resolve();
    let first = SensorRef {
        device_id: params.device1,
        sensor_id: params.sensor1,
    };
    let second = SensorRef {
        device_id: params.device2,
        sensor_id: params.sensor2,
    };
    let report = monitor
        .analytics
        .correlation(first, second, start, end)
        .await?;
    Ok(Json(report))
}

async fn system_stats(State(monitor): State<AppState>) -> Json<SystemStats> {
    Json(monitor.system_stats())
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Capacity(_) | Error::Duplicate(_) | Error::State(_) => StatusCode::CONFLICT,
        Error::InsufficientData(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Disabled(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self
            .0
            .downcast_ref::<Error>()
            .map(status_for)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            error!("API error: {}", self.0);
        } else {
            warn!("API request rejected: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
