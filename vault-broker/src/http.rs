use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Extension, Json, Router};
use tracing::{Instrument, info};

use crate::auth;
use crate::error::{AppError, attach_correlation};
use crate::models::{
    BindRequest, BindResponse, EmptyResponse, LastOperationResponse, ProvisionRequest,
    UpdateRequest,
};
use crate::state::AppState;
use crate::telemetry::{BrokerOperation, CorrelationId, correlation_layer, request_span};

pub fn router(state: AppState) -> Router {
    let api = api_routes().layer(middleware::from_fn_with_state(
        state.clone(),
        auth::http_layer,
    ));

    Router::new()
        .route("/healthz", get(health_check))
        .merge(api)
        .layer(middleware::from_fn(correlation_layer))
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/v2/catalog", get(catalog))
        .route(
            "/v2/service_instances/{instance_id}",
            put(provision).patch(update).delete(deprovision),
        )
        .route(
            "/v2/service_instances/{instance_id}/last_operation",
            get(last_operation),
        )
        .route(
            "/v2/service_instances/{instance_id}/service_bindings/{binding_id}",
            put(bind).delete(unbind),
        )
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let running = state.manager.is_running();
    let status = if running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": if running { "ok" } else { "stopped" },
        "bindings": state.manager.renewals().len(),
    });
    (status, Json(body))
}

async fn catalog(State(state): State<AppState>) -> impl IntoResponse {
    info!("listing services");
    Json(state.catalog.as_ref().clone())
}

async fn provision(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(instance_id): Path<String>,
    Json(request): Json<ProvisionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let span = request_span(
        BrokerOperation::Provision,
        &correlation,
        &instance_id,
        None,
    );
    async move {
        check_service(&state, &request.service_id)?;
        let (organization_id, space_id) = request.placement();
        let existed = state.manager.tenants().contains(&instance_id);
        state
            .manager
            .provision(&instance_id, &organization_id, &space_id)
            .await?;
        let status = if existed {
            StatusCode::OK
        } else {
            StatusCode::CREATED
        };
        Ok::<_, AppError>((status, Json(EmptyResponse::default())))
    }
    .instrument(span)
    .await
    .map_err(|err| attach_correlation(err, &correlation))
}

async fn update(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(instance_id): Path<String>,
    Json(request): Json<UpdateRequest>,
) -> Result<impl IntoResponse, AppError> {
    let span = request_span(
        BrokerOperation::Update,
        &correlation,
        &instance_id,
        None,
    );
    async move {
        check_service(&state, &request.service_id)?;
        state.manager.update(&instance_id).await?;
        Ok::<_, AppError>(Json(EmptyResponse::default()))
    }
    .instrument(span)
    .await
    .map_err(|err| attach_correlation(err, &correlation))
}

async fn deprovision(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let span = request_span(
        BrokerOperation::Deprovision,
        &correlation,
        &instance_id,
        None,
    );
    async move {
        state.manager.deprovision(&instance_id).await?;
        Ok::<_, AppError>(Json(EmptyResponse::default()))
    }
    .instrument(span)
    .await
    .map_err(|err| attach_correlation(err, &correlation))
}

async fn last_operation(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let span = request_span(
        BrokerOperation::LastOperation,
        &correlation,
        &instance_id,
        None,
    );
    let operation = state
        .manager
        .last_operation(&instance_id)
        .instrument(span)
        .await
        .map_err(|err| attach_correlation(err.into(), &correlation))?;
    Ok(Json(LastOperationResponse {
        state: operation,
        description: None,
    }))
}

async fn bind(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    Json(request): Json<BindRequest>,
) -> Result<impl IntoResponse, AppError> {
    let span = request_span(
        BrokerOperation::Bind,
        &correlation,
        &instance_id,
        Some(&binding_id),
    );
    async move {
        check_service(&state, &request.service_id)?;
        let credentials = state.manager.bind(&instance_id, &binding_id).await?;
        Ok::<_, AppError>((StatusCode::CREATED, Json(BindResponse { credentials })))
    }
    .instrument(span)
    .await
    .map_err(|err| attach_correlation(err, &correlation))
}

async fn unbind(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path((instance_id, binding_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let span = request_span(
        BrokerOperation::Unbind,
        &correlation,
        &instance_id,
        Some(&binding_id),
    );
    async move {
        state
            .manager
            .unbind(&instance_id, &binding_id)
            .await
            .map_err(|err| AppError::from(err).gone_if_not_found())?;
        Ok::<_, AppError>(Json(EmptyResponse::default()))
    }
    .instrument(span)
    .await
    .map_err(|err| attach_correlation(err, &correlation))
}

fn check_service(state: &AppState, service_id: &str) -> Result<(), AppError> {
    match state.service_id() {
        Some(expected) if expected == service_id => Ok(()),
        _ => Err(AppError::bad_request(format!(
            "unknown service id `{service_id}`"
        ))),
    }
}
