use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header::AUTHORIZATION};
use serde_json::Value;
use tower::ServiceExt;
use vault_broker::AppState;
use vault_broker::auth::BasicCredentials;
use vault_broker::config::BrokerConfig;
use vault_broker_provider_dev::DevBackend;

pub const USERNAME: &str = "broker";
pub const PASSWORD: &str = "hunter2";
pub const SERVICE_ID: &str = "0654695e-0760-a1d4-1cad-5dd87b75ed99";

pub struct TestBroker {
    pub app: Router,
    pub state: AppState,
    pub backend: DevBackend,
}

pub fn config() -> BrokerConfig {
    let env: HashMap<&str, &str> = HashMap::from([
        ("SECURITY_USER_NAME", USERNAME),
        ("SECURITY_USER_PASSWORD", PASSWORD),
        ("SECRETS_BACKEND", "dev"),
        ("VAULT_ADDR", "vault.example.com:8200"),
        ("VAULT_RENEW", "false"),
    ]);
    BrokerConfig::from_lookup(|key| env.get(key).map(|value| value.to_string()))
        .and_then(BrokerConfig::validate)
        .expect("test config")
}

pub async fn broker() -> TestBroker {
    broker_with(DevBackend::new()).await
}

pub async fn broker_with(backend: DevBackend) -> TestBroker {
    let state = vault_broker::build_state_with_backend(&config(), Arc::new(backend.clone()))
        .await
        .expect("state");
    let app = vault_broker::http::router(state.clone());
    TestBroker {
        app,
        state,
        backend,
    }
}

pub fn basic_auth() -> String {
    BasicCredentials::new(USERNAME, PASSWORD).header_value()
}

pub async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(AUTHORIZATION, basic_auth())
        .header("content-type", "application/json")
        .body(body.map_or_else(Body::empty, |body| Body::from(body.to_string())))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}
