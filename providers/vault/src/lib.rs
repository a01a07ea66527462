//! HashiCorp Vault backend using the live Vault HTTP API.
//!
//! Policies, token roles, tokens and mounts are managed through the `sys/` and
//! `auth/token/` endpoints. Broker state is kept in a generic (KV v1) mount, so
//! reads, writes and lists go straight to `v1/<path>`.

use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::debug;
use vault_broker_core::{
    CredentialRequest, Data, Error, IssuedCredential, RenewedLease, Result, SecretsBackend,
    TokenLookup, TokenRole,
};

const DEFAULT_ADDR: &str = "https://127.0.0.1:8200";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct VaultProviderConfig {
    pub addr: String,
    pub token: String,
    pub namespace: Option<String>,
    pub timeout: Duration,
    pub ca_bundle: Option<Vec<u8>>,
    pub insecure_skip_tls: bool,
}

impl VaultProviderConfig {
    pub fn new(addr: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            token: token.into(),
            namespace: None,
            timeout: DEFAULT_TIMEOUT,
            ca_bundle: None,
            insecure_skip_tls: false,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let addr = std::env::var("VAULT_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
        let token =
            std::env::var("VAULT_TOKEN").context("set VAULT_TOKEN for Vault authentication")?;
        let namespace = std::env::var("VAULT_NAMESPACE")
            .ok()
            .filter(|value| !value.is_empty());
        let timeout = std::env::var("VAULT_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);
        let ca_bundle = std::env::var("VAULT_CA_BUNDLE")
            .ok()
            .map(|path| fs::read(path).context("failed to read VAULT_CA_BUNDLE"))
            .transpose()?;
        let insecure_skip_tls = std::env::var("VAULT_INSECURE_SKIP_TLS")
            .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE"))
            .unwrap_or(false);

        Ok(Self {
            addr,
            token,
            namespace,
            timeout,
            ca_bundle,
            insecure_skip_tls,
        })
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace.filter(|value| !value.is_empty());
        self
    }

    fn build_http_client(&self) -> anyhow::Result<Client> {
        let mut builder = Client::builder().timeout(self.timeout);
        if let Some(ca) = self.ca_bundle.as_ref() {
            let cert = reqwest::Certificate::from_pem(ca)
                .or_else(|_| reqwest::Certificate::from_der(ca))
                .context("failed to parse VAULT_CA_BUNDLE")?;
            builder = builder.add_root_certificate(cert);
        }
        if self.insecure_skip_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        builder.build().context("failed to build Vault HTTP client")
    }
}

impl std::fmt::Debug for VaultProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultProviderConfig")
            .field("addr", &self.addr)
            .field("namespace", &self.namespace)
            .field("timeout", &self.timeout)
            .field("insecure_skip_tls", &self.insecure_skip_tls)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub struct VaultBackend {
    config: VaultProviderConfig,
    client: Client,
}

impl VaultBackend {
    pub fn new(config: VaultProviderConfig) -> anyhow::Result<Self> {
        let client = config.build_http_client()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &VaultProviderConfig {
        &self.config
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> Result<Response> {
        let url = format!(
            "{}/v1/{}",
            self.config.addr.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        debug!(%method, %url, "vault request");
        let mut builder = self
            .client
            .request(method, url)
            .header("X-Vault-Token", token.unwrap_or(&self.config.token));
        if let Some(namespace) = &self.config.namespace {
            builder = builder.header("X-Vault-Namespace", namespace);
        }
        if let Some(payload) = body {
            builder = builder.json(&payload);
        }
        builder
            .send()
            .await
            .map_err(|err| Error::backend(format!("vault request failed: {err}")))
    }

    /// Send a request whose response body is irrelevant.
    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<()> {
        let response = self.request(method, path, None, body).await?;
        expect_success(response).await.map(drop)
    }

    async fn auth(&self, path: &str, token: Option<&str>, body: Value) -> Result<AuthBody> {
        let response = self.request(Method::POST, path, token, Some(body)).await?;
        let envelope: AuthResponse = parse(expect_success(response).await?).await?;
        envelope
            .auth
            .ok_or_else(|| Error::backend(format!("{path} came back with empty auth")))
    }
}

#[async_trait]
impl SecretsBackend for VaultBackend {
    async fn write_policy(&self, name: &str, document: &str) -> Result<()> {
        self.call(
            Method::PUT,
            &format!("sys/policies/acl/{name}"),
            Some(json!({ "policy": document })),
        )
        .await
    }

    async fn delete_policy(&self, name: &str) -> Result<()> {
        self.call(Method::DELETE, &format!("sys/policies/acl/{name}"), None)
            .await
    }

    async fn write_role(&self, name: &str, role: &TokenRole) -> Result<()> {
        let body = serde_json::to_value(role)
            .map_err(|err| Error::backend(format!("failed to encode role: {err}")))?;
        self.call(Method::POST, &format!("auth/token/roles/{name}"), Some(body))
            .await
    }

    async fn delete_role(&self, name: &str) -> Result<()> {
        self.call(Method::DELETE, &format!("auth/token/roles/{name}"), None)
            .await
    }

    async fn create_credential(
        &self,
        role: &str,
        request: &CredentialRequest,
    ) -> Result<IssuedCredential> {
        let body = serde_json::to_value(request)
            .map_err(|err| Error::backend(format!("failed to encode token request: {err}")))?;
        let auth = self
            .auth(&format!("auth/token/create/{role}"), None, body)
            .await?;
        Ok(IssuedCredential {
            token: auth.client_token,
            accessor: auth.accessor,
            lease_duration_secs: auth.lease_duration,
        })
    }

    async fn renew_self(&self, token: &str) -> Result<RenewedLease> {
        let auth = self
            .auth("auth/token/renew-self", Some(token), json!({}))
            .await?;
        Ok(RenewedLease {
            lease_duration_secs: auth.lease_duration,
        })
    }

    async fn revoke_accessor(&self, accessor: &str) -> Result<()> {
        self.call(
            Method::POST,
            "auth/token/revoke-accessor",
            Some(json!({ "accessor": accessor })),
        )
        .await
    }

    async fn lookup_broker_token(&self) -> Result<TokenLookup> {
        let response = self
            .request(Method::GET, "auth/token/lookup-self", None, None)
            .await?;
        let lookup: LookupResponse = parse(expect_success(response).await?).await?;
        Ok(TokenLookup {
            accessor: lookup.data.accessor,
            ttl_secs: lookup.data.ttl,
            renewable: lookup.data.renewable,
            expires: lookup.data.expire_time.is_some(),
        })
    }

    async fn renew_broker_token(&self) -> Result<RenewedLease> {
        let auth = self.auth("auth/token/renew-self", None, json!({})).await?;
        Ok(RenewedLease {
            lease_duration_secs: auth.lease_duration,
        })
    }

    async fn list_mounts(&self) -> Result<BTreeMap<String, String>> {
        let response = self.request(Method::GET, "sys/mounts", None, None).await?;
        let body: Map<String, Value> = parse(expect_success(response).await?).await?;
        Ok(mount_table(body))
    }

    async fn mount(&self, path: &str, kind: &str) -> Result<()> {
        self.call(
            Method::POST,
            &format!("sys/mounts/{}", path.trim_matches('/')),
            Some(json!({ "type": kind })),
        )
        .await
    }

    async fn unmount(&self, path: &str) -> Result<()> {
        self.call(
            Method::DELETE,
            &format!("sys/mounts/{}", path.trim_matches('/')),
            None,
        )
        .await
    }

    async fn read(&self, path: &str) -> Result<Option<Data>> {
        let response = self.request(Method::GET, path, None, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let secret: SecretResponse = parse(expect_success(response).await?).await?;
        Ok(secret.data)
    }

    async fn write(&self, path: &str, data: Data) -> Result<()> {
        self.call(Method::POST, path, Some(Value::Object(data)))
            .await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.call(Method::DELETE, path, None).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let method = Method::from_bytes(b"LIST")
            .map_err(|err| Error::backend(format!("invalid LIST method: {err}")))?;
        let response = self.request(method, prefix, None, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let listing: ListResponse = parse(expect_success(response).await?).await?;
        Ok(listing.data.keys.unwrap_or_default())
    }
}

async fn expect_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorResponse>(&body)
        .map(|parsed| parsed.errors.join(", "))
        .unwrap_or(body);
    Err(Error::backend(format!("{status}: {detail}")))
}

async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
    let body = response
        .text()
        .await
        .map_err(|err| Error::backend(format!("failed to read vault response: {err}")))?;
    serde_json::from_str(&body)
        .map_err(|err| Error::backend(format!("failed to decode vault response: {err}; body={body}")))
}

// Newer servers wrap the table in `data`; older ones return it at the top level
// next to the response metadata.
fn mount_table(mut body: Map<String, Value>) -> BTreeMap<String, String> {
    let table = match body.remove("data") {
        Some(Value::Object(data)) => data,
        _ => body,
    };
    table
        .into_iter()
        .filter_map(|(path, mount)| {
            let kind = mount.get("type")?.as_str()?.to_string();
            Some((path, kind))
        })
        .collect()
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Deserialize)]
struct AuthResponse {
    auth: Option<AuthBody>,
}

#[derive(Deserialize)]
struct AuthBody {
    client_token: String,
    accessor: String,
    #[serde(default)]
    lease_duration: u64,
}

#[derive(Deserialize)]
struct LookupResponse {
    data: LookupData,
}

#[derive(Deserialize)]
struct LookupData {
    #[serde(default)]
    accessor: String,
    #[serde(default)]
    ttl: u64,
    #[serde(default)]
    renewable: bool,
    #[serde(default)]
    expire_time: Option<String>,
}

#[derive(Deserialize)]
struct SecretResponse {
    data: Option<Data>,
}

#[derive(Deserialize)]
struct ListResponse {
    data: KeyListData,
}

#[derive(Deserialize)]
struct KeyListData {
    keys: Option<Vec<String>>,
}
