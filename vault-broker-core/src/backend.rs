//! Contract the broker consumes from the secrets service.
//!
//! The Vault HTTP provider implements this against a live server, the dev
//! provider implements it in memory. Lookups of absent data are not errors:
//! `read` returns `None` and `list` returns an empty vector.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Generic key/value payload stored at a logical path.
pub type Data = Map<String, Value>;

/// Token role definition written during provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRole {
    pub allowed_policies: Vec<String>,
    #[serde(with = "duration_secs")]
    pub period: Duration,
    pub renewable: bool,
}

/// Parameters for issuing a binding credential against a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRequest {
    pub policies: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub display_name: String,
    pub renewable: bool,
}

/// Credential returned by the issuance primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCredential {
    pub token: String,
    pub accessor: String,
    pub lease_duration_secs: u64,
}

/// Outcome of a renew-self call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewedLease {
    pub lease_duration_secs: u64,
}

/// Lookup of the broker's own token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenLookup {
    pub accessor: String,
    pub ttl_secs: u64,
    pub renewable: bool,
    /// `false` for root-like tokens without an expire time.
    pub expires: bool,
}

#[async_trait]
pub trait SecretsBackend: Send + Sync {
    async fn write_policy(&self, name: &str, document: &str) -> Result<()>;
    async fn delete_policy(&self, name: &str) -> Result<()>;

    async fn write_role(&self, name: &str, role: &TokenRole) -> Result<()>;
    async fn delete_role(&self, name: &str) -> Result<()>;

    async fn create_credential(
        &self,
        role: &str,
        request: &CredentialRequest,
    ) -> Result<IssuedCredential>;
    /// Renew a credential using the credential itself as the caller.
    async fn renew_self(&self, token: &str) -> Result<RenewedLease>;
    async fn revoke_accessor(&self, accessor: &str) -> Result<()>;

    async fn lookup_broker_token(&self) -> Result<TokenLookup>;
    async fn renew_broker_token(&self) -> Result<RenewedLease>;

    /// Mount table keyed by path (as returned by the backend, separators included)
    /// with the mount type as value.
    async fn list_mounts(&self) -> Result<BTreeMap<String, String>>;
    async fn mount(&self, path: &str, kind: &str) -> Result<()>;
    async fn unmount(&self, path: &str) -> Result<()>;

    async fn read(&self, path: &str) -> Result<Option<Data>>;
    async fn write(&self, path: &str, data: Data) -> Result<()>;
    async fn delete(&self, path: &str) -> Result<()>;
    /// Immediate children of `prefix`. Folders carry a trailing `/`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

#[async_trait]
impl<T> SecretsBackend for Arc<T>
where
    T: SecretsBackend + ?Sized,
{
    async fn write_policy(&self, name: &str, document: &str) -> Result<()> {
        (**self).write_policy(name, document).await
    }

    async fn delete_policy(&self, name: &str) -> Result<()> {
        (**self).delete_policy(name).await
    }

    async fn write_role(&self, name: &str, role: &TokenRole) -> Result<()> {
        (**self).write_role(name, role).await
    }

    async fn delete_role(&self, name: &str) -> Result<()> {
        (**self).delete_role(name).await
    }

    async fn create_credential(
        &self,
        role: &str,
        request: &CredentialRequest,
    ) -> Result<IssuedCredential> {
        (**self).create_credential(role, request).await
    }

    async fn renew_self(&self, token: &str) -> Result<RenewedLease> {
        (**self).renew_self(token).await
    }

    async fn revoke_accessor(&self, accessor: &str) -> Result<()> {
        (**self).revoke_accessor(accessor).await
    }

    async fn lookup_broker_token(&self) -> Result<TokenLookup> {
        (**self).lookup_broker_token().await
    }

    async fn renew_broker_token(&self) -> Result<RenewedLease> {
        (**self).renew_broker_token().await
    }

    async fn list_mounts(&self) -> Result<BTreeMap<String, String>> {
        (**self).list_mounts().await
    }

    async fn mount(&self, path: &str, kind: &str) -> Result<()> {
        (**self).mount(path, kind).await
    }

    async fn unmount(&self, path: &str) -> Result<()> {
        (**self).unmount(path).await
    }

    async fn read(&self, path: &str) -> Result<Option<Data>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, data: Data) -> Result<()> {
        (**self).write(path, data).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).list(prefix).await
    }
}

/// Shared handle used throughout the broker.
pub type SharedBackend = Arc<dyn SecretsBackend>;

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
