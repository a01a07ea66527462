use axum::body::Body;
use axum::http::{Request, StatusCode, header::AUTHORIZATION, header::WWW_AUTHENTICATE};
#[path = "support/mod.rs"]
mod support;

use serde_json::json;
use support::{SERVICE_ID, broker, send};
use tower::ServiceExt;
use vault_broker::telemetry::{CORRELATION_ID_HEADER, VCAP_REQUEST_ID_HEADER};
use vault_broker_provider_dev::Operation;

fn provision_body() -> serde_json::Value {
    json!({
        "service_id": SERVICE_ID,
        "plan_id": format!("{SERVICE_ID}.shared"),
        "organization_guid": "org-1",
        "space_guid": "space-1"
    })
}

fn bind_body() -> serde_json::Value {
    json!({
        "service_id": SERVICE_ID,
        "plan_id": format!("{SERVICE_ID}.shared"),
        "bind_resource": {"app_guid": "app-1"}
    })
}

#[tokio::test]
async fn healthz_needs_no_credentials() {
    let broker = broker().await;
    let response = broker
        .app
        .clone()
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn catalog_requires_basic_auth() {
    let broker = broker().await;

    let response = broker
        .app
        .clone()
        .oneshot(Request::get("/v2/catalog").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(WWW_AUTHENTICATE));

    let response = broker
        .app
        .clone()
        .oneshot(
            Request::get("/v2/catalog")
                .header(AUTHORIZATION, "Basic YnJva2VyOndyb25n")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let (status, body) = send(&broker.app, "GET", "/v2/catalog", None).await;
    assert_eq!(status, StatusCode::OK);
    let service = &body["services"][0];
    assert_eq!(service["id"], SERVICE_ID);
    assert_eq!(service["name"], "hashicorp-vault");
    assert_eq!(service["bindable"], true);
    assert_eq!(service["plans"][0]["id"], format!("{SERVICE_ID}.shared"));
    assert_eq!(service["plans"][0]["free"], true);
}

#[tokio::test]
async fn full_lifecycle_over_http() {
    let broker = broker().await;
    let instance = "/v2/service_instances/inst-1";
    let binding = "/v2/service_instances/inst-1/service_bindings/bind-1";

    let (status, body) = send(&broker.app, "PUT", instance, Some(provision_body())).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert!(broker.backend.policy("cf-inst-1").is_some());

    let (status, _) = send(&broker.app, "PUT", instance, Some(provision_body())).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&broker.app, "PUT", binding, Some(bind_body())).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let credentials = &body["credentials"];
    assert_eq!(credentials["address"], "https://vault.example.com:8200/");
    assert_eq!(credentials["backends"]["generic"], "cf/inst-1/secret");
    assert_eq!(credentials["backends"]["transit"], "cf/inst-1/transit");
    assert_eq!(credentials["backends_shared"]["organization"], "cf/org-1/secret");
    assert_eq!(credentials["backends_shared"]["space"], "cf/space-1/secret");
    let accessor = credentials["auth"]["accessor"].as_str().unwrap().to_string();
    assert!(broker.state.manager.renewals().contains("bind-1"));

    let (status, _) = send(&broker.app, "PUT", binding, Some(bind_body())).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(
        &broker.app,
        "GET",
        "/v2/service_instances/inst-1/last_operation",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"state": "succeeded"}));

    let (status, _) = send(&broker.app, "DELETE", binding, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(broker.backend.token_by_accessor(&accessor).unwrap().revoked);
    assert!(!broker.state.manager.renewals().contains("bind-1"));

    let (status, body) = send(&broker.app, "DELETE", binding, None).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["error"], "gone");

    let (status, _) = send(&broker.app, "DELETE", instance, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(broker.backend.policy("cf-inst-1").is_none());
    assert!(!broker.backend.mounts().contains_key("cf/inst-1/secret/"));
    assert!(broker.backend.mounts().contains_key("cf/org-1/secret/"));
}

#[tokio::test]
async fn bind_without_provision_is_not_found() {
    let broker = broker().await;
    let before = broker.backend.data_paths();

    let (status, body) = send(
        &broker.app,
        "PUT",
        "/v2/service_instances/missing/service_bindings/bind-1",
        Some(bind_body()),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
    assert_eq!(body["description"], "instance missing does not exist");
    assert_eq!(broker.backend.data_paths(), before);
    assert!(broker.backend.tokens().is_empty());
}

#[tokio::test]
async fn provision_rejects_unknown_service_and_missing_placement() {
    let broker = broker().await;

    let mut body = provision_body();
    body["service_id"] = json!("other");
    let (status, _) = send(&broker.app, "PUT", "/v2/service_instances/i", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let body = json!({"service_id": SERVICE_ID, "plan_id": "p", "organization_guid": "org"});
    let (status, body) = send(&broker.app, "PUT", "/v2/service_instances/i", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["description"], "space id must not be empty");
}

#[tokio::test]
async fn backend_failures_are_internal_errors() {
    let broker = broker().await;
    broker
        .backend
        .fail(Operation::WritePolicy, "permission denied");

    let (status, body) = send(
        &broker.app,
        "PUT",
        "/v2/service_instances/inst-1",
        Some(provision_body()),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        body["description"],
        "failed to create policy cf-inst-1: permission denied"
    );
    assert!(!broker.state.manager.tenants().contains("inst-1"));
}

#[tokio::test]
async fn correlation_id_is_echoed() {
    let broker = broker().await;
    let response = broker
        .app
        .clone()
        .oneshot(
            Request::get("/v2/service_instances/none/last_operation")
                .header(AUTHORIZATION, support::basic_auth())
                .header(CORRELATION_ID_HEADER, "corr-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(CORRELATION_ID_HEADER).unwrap(),
        "corr-123"
    );
}

#[tokio::test]
async fn router_request_id_becomes_the_correlation_id() {
    let broker = broker().await;
    let response = broker
        .app
        .clone()
        .oneshot(
            Request::get("/v2/service_instances/none/last_operation")
                .header(AUTHORIZATION, support::basic_auth())
                .header(VCAP_REQUEST_ID_HEADER, "vcap-456")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        response.headers().get(CORRELATION_ID_HEADER).unwrap(),
        "vcap-456"
    );
}

#[tokio::test]
async fn stopped_broker_is_unavailable() {
    let broker = broker().await;
    broker.state.manager.stop();

    let (status, body) = send(
        &broker.app,
        "PUT",
        "/v2/service_instances/inst-1",
        Some(provision_body()),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "unavailable");

    let response = broker
        .app
        .clone()
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn encoded_slashes_in_ids_are_rejected() {
    let broker = broker().await;
    let mounts = broker.backend.mounts();

    let (status, body) = send(
        &broker.app,
        "PUT",
        "/v2/service_instances/org-1%2Fsecret",
        Some(provision_body()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");
    assert_eq!(body["description"], "instance id must not contain '/'");
    assert!(broker.backend.policy("cf-org-1/secret").is_none());
    assert_eq!(broker.backend.mounts(), mounts);

    let (status, _) = send(
        &broker.app,
        "PUT",
        "/v2/service_instances/inst-1",
        Some(provision_body()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, body) = send(
        &broker.app,
        "PUT",
        "/v2/service_instances/inst-1/service_bindings/b%2F1",
        Some(bind_body()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["description"], "binding id must not contain '/'");
    assert!(broker.backend.tokens().is_empty());
}
