use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{Instrument, Span, field, info_span};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
/// Set by the Cloud Foundry router on every request it forwards.
pub const VCAP_REQUEST_ID_HEADER: &str = "x-vcap-request-id";
pub const API_VERSION_HEADER: &str = "x-broker-api-version";

#[derive(Clone, Debug)]
pub struct CorrelationId(pub String);

/// Broker API operations, named as they appear in logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrokerOperation {
    Provision,
    Update,
    Deprovision,
    LastOperation,
    Bind,
    Unbind,
}

impl BrokerOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            BrokerOperation::Provision => "osb.provision",
            BrokerOperation::Update => "osb.update",
            BrokerOperation::Deprovision => "osb.deprovision",
            BrokerOperation::LastOperation => "osb.last_operation",
            BrokerOperation::Bind => "osb.bind",
            BrokerOperation::Unbind => "osb.unbind",
        }
    }
}

/// Install the JSON log subscriber. `RUST_LOG` overrides the `info` default;
/// `verbose` lowers the default to `debug`.
pub fn init(verbose: bool) -> anyhow::Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(true),
        )
        .try_init()
        .ok();

    Ok(())
}

pub fn correlation_header_value(value: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(value).ok()
}

/// Caller supplied id, else the router's request id, else a fresh one.
pub fn correlation_id(headers: &HeaderMap) -> String {
    [CORRELATION_ID_HEADER, VCAP_REQUEST_ID_HEADER]
        .into_iter()
        .filter_map(|name| headers.get(name))
        .filter_map(|value| value.to_str().ok())
        .find(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub async fn correlation_layer(mut req: Request<Body>, next: Next) -> Response {
    let correlation_id = correlation_id(req.headers());
    let api_version = req
        .headers()
        .get(API_VERSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unset")
        .to_string();

    req.extensions_mut()
        .insert(CorrelationId(correlation_id.clone()));

    let span = info_span!(
        "request",
        method = %req.method(),
        uri = %req.uri(),
        api_version = %api_version,
        correlation_id = %correlation_id
    );

    let mut response = next.run(req).instrument(span).await;
    if let Some(value) = correlation_header_value(&correlation_id) {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    response
}

/// Span for one broker operation on an instance, and on a binding when the
/// operation targets one.
pub fn request_span(
    operation: BrokerOperation,
    correlation: &CorrelationId,
    instance_id: &str,
    binding_id: Option<&str>,
) -> Span {
    let span = info_span!(
        "broker.op",
        operation = operation.as_str(),
        correlation_id = %correlation.0,
        instance_id = %instance_id,
        binding_id = field::Empty,
    );
    if let Some(binding_id) = binding_id {
        span.record("binding_id", binding_id);
    }
    span
}
