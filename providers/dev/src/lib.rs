//! In-memory stand-in for Vault.
//!
//! [`DevBackend`] implements the broker's backend contract with Vault-like
//! semantics where the broker depends on them: writes need a mount, mounting
//! an existing path fails, listings return immediate children with a trailing
//! `/` on folders, and renewing a revoked token fails. Failures can be
//! injected per operation so tests can exercise error paths.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;
use vault_broker_core::{
    CredentialRequest, Data, Error, IssuedCredential, RenewedLease, Result, SecretsBackend,
    TokenLookup, TokenRole,
};

const DEFAULT_LEASE_SECS: u64 = 3600;
const DEFAULT_MOUNTS: [(&str, &str); 4] = [
    ("cubbyhole/", "cubbyhole"),
    ("identity/", "identity"),
    ("secret/", "generic"),
    ("sys/", "system"),
];

/// Backend operations, used for failure injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    WritePolicy,
    DeletePolicy,
    WriteRole,
    DeleteRole,
    CreateCredential,
    RenewSelf,
    RevokeAccessor,
    LookupBrokerToken,
    RenewBrokerToken,
    ListMounts,
    Mount,
    Unmount,
    Read,
    Write,
    Delete,
    List,
}

/// A token issued by [`DevBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub accessor: String,
    pub role: String,
    pub policies: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub display_name: String,
    pub renewals: u64,
    pub revoked: bool,
}

#[derive(Default)]
struct State {
    policies: BTreeMap<String, String>,
    roles: BTreeMap<String, TokenRole>,
    tokens: HashMap<String, IssuedToken>,
    accessors: HashMap<String, String>,
    mounts: BTreeMap<String, String>,
    data: BTreeMap<String, Data>,
    failures: HashMap<Operation, String>,
    calls: HashMap<Operation, u64>,
    lease_secs: u64,
    renew_latency: Option<Duration>,
    broker_token: Option<TokenLookup>,
    broker_renewals: u64,
}

impl State {
    fn fresh() -> Self {
        Self {
            mounts: DEFAULT_MOUNTS
                .iter()
                .map(|(path, kind)| (path.to_string(), kind.to_string()))
                .collect(),
            lease_secs: DEFAULT_LEASE_SECS,
            ..Self::default()
        }
    }

    fn enter(&mut self, operation: Operation) -> Result<()> {
        *self.calls.entry(operation).or_default() += 1;
        match self.failures.get(&operation) {
            Some(message) => Err(Error::backend(message)),
            None => Ok(()),
        }
    }

    fn is_mounted(&self, path: &str) -> bool {
        let path = mount_key(path);
        self.mounts.keys().any(|mount| path.starts_with(mount.as_str()))
    }
}

/// In-memory backend. Clones share state.
#[derive(Clone)]
pub struct DevBackend {
    state: Arc<RwLock<State>>,
}

impl Default for DevBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DevBackend {
    /// Empty backend with Vault's default mounts and a one hour credential lease.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::fresh())),
        }
    }

    /// Lease granted to new and renewed credentials.
    pub fn with_lease(self, lease_secs: u64) -> Self {
        self.set_lease(lease_secs);
        self
    }

    /// Lookup result for the broker's own token. Without one, the broker token
    /// is reported as never expiring.
    pub fn with_broker_token(self, lookup: TokenLookup) -> Self {
        self.state.write().broker_token = Some(lookup);
        self
    }

    pub fn set_lease(&self, lease_secs: u64) {
        self.state.write().lease_secs = lease_secs;
    }

    /// Delay every credential renewal by `latency`.
    pub fn set_renew_latency(&self, latency: Option<Duration>) {
        self.state.write().renew_latency = latency;
    }

    /// Make every call to `operation` fail with `message` until cleared.
    pub fn fail(&self, operation: Operation, message: impl Into<String>) {
        self.state.write().failures.insert(operation, message.into());
    }

    pub fn clear_failure(&self, operation: Operation) {
        self.state.write().failures.remove(&operation);
    }

    pub fn calls(&self, operation: Operation) -> u64 {
        self.state
            .read()
            .calls
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    pub fn policy(&self, name: &str) -> Option<String> {
        self.state.read().policies.get(name).cloned()
    }

    pub fn role(&self, name: &str) -> Option<TokenRole> {
        self.state.read().roles.get(name).cloned()
    }

    /// Mount table keyed by normalized path (trailing `/`).
    pub fn mounts(&self) -> BTreeMap<String, String> {
        self.state.read().mounts.clone()
    }

    pub fn data(&self, path: &str) -> Option<Data> {
        self.state.read().data.get(path.trim_matches('/')).cloned()
    }

    pub fn data_paths(&self) -> Vec<String> {
        self.state.read().data.keys().cloned().collect()
    }

    pub fn token_by_accessor(&self, accessor: &str) -> Option<IssuedToken> {
        let state = self.state.read();
        let token = state.accessors.get(accessor)?;
        state.tokens.get(token).cloned()
    }

    pub fn tokens(&self) -> Vec<IssuedToken> {
        let mut tokens: Vec<IssuedToken> = self.state.read().tokens.values().cloned().collect();
        tokens.sort_by(|a, b| a.accessor.cmp(&b.accessor));
        tokens
    }

    /// Total successful credential renewals across all tokens.
    pub fn renewals(&self) -> u64 {
        self.state.read().tokens.values().map(|token| token.renewals).sum()
    }

    pub fn broker_renewals(&self) -> u64 {
        self.state.read().broker_renewals
    }

    /// Store raw data at `path`, bypassing mount checks and failure injection.
    pub fn seed(&self, path: &str, data: Data) {
        self.state
            .write()
            .data
            .insert(path.trim_matches('/').to_string(), data);
    }
}

#[async_trait]
impl SecretsBackend for DevBackend {
    async fn write_policy(&self, name: &str, document: &str) -> Result<()> {
        let mut state = self.state.write();
        state.enter(Operation::WritePolicy)?;
        state.policies.insert(name.to_string(), document.to_string());
        Ok(())
    }

    async fn delete_policy(&self, name: &str) -> Result<()> {
        let mut state = self.state.write();
        state.enter(Operation::DeletePolicy)?;
        state.policies.remove(name);
        Ok(())
    }

    async fn write_role(&self, name: &str, role: &TokenRole) -> Result<()> {
        let mut state = self.state.write();
        state.enter(Operation::WriteRole)?;
        state.roles.insert(name.to_string(), role.clone());
        Ok(())
    }

    async fn delete_role(&self, name: &str) -> Result<()> {
        let mut state = self.state.write();
        state.enter(Operation::DeleteRole)?;
        state.roles.remove(name);
        Ok(())
    }

    async fn create_credential(
        &self,
        role: &str,
        request: &CredentialRequest,
    ) -> Result<IssuedCredential> {
        let mut state = self.state.write();
        state.enter(Operation::CreateCredential)?;
        let Some(definition) = state.roles.get(role) else {
            return Err(Error::backend(format!("unknown role: {role}")));
        };
        if let Some(policy) = request
            .policies
            .iter()
            .find(|policy| !definition.allowed_policies.contains(policy))
        {
            return Err(Error::backend(format!(
                "token policies ({policy}) must be subset of the role's allowed policies"
            )));
        }

        let issued = IssuedToken {
            token: format!("s.{}", Uuid::new_v4().simple()),
            accessor: Uuid::new_v4().to_string(),
            role: role.to_string(),
            policies: request.policies.clone(),
            metadata: request.metadata.clone(),
            display_name: format!("token-{}", request.display_name),
            renewals: 0,
            revoked: false,
        };
        debug!(%role, accessor = %issued.accessor, "issued token");
        let credential = IssuedCredential {
            token: issued.token.clone(),
            accessor: issued.accessor.clone(),
            lease_duration_secs: state.lease_secs,
        };
        state
            .accessors
            .insert(issued.accessor.clone(), issued.token.clone());
        state.tokens.insert(issued.token.clone(), issued);
        Ok(credential)
    }

    async fn renew_self(&self, token: &str) -> Result<RenewedLease> {
        let latency = {
            let mut state = self.state.write();
            state.enter(Operation::RenewSelf)?;
            state.renew_latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.write();
        let lease_duration_secs = state.lease_secs;
        match state.tokens.get_mut(token) {
            Some(issued) if !issued.revoked => {
                issued.renewals += 1;
                Ok(RenewedLease {
                    lease_duration_secs,
                })
            }
            _ => Err(Error::backend("permission denied")),
        }
    }

    async fn revoke_accessor(&self, accessor: &str) -> Result<()> {
        let mut state = self.state.write();
        state.enter(Operation::RevokeAccessor)?;
        let Some(token) = state.accessors.get(accessor).cloned() else {
            return Err(Error::backend("invalid accessor"));
        };
        if let Some(issued) = state.tokens.get_mut(&token) {
            issued.revoked = true;
        }
        Ok(())
    }

    async fn lookup_broker_token(&self) -> Result<TokenLookup> {
        let mut state = self.state.write();
        state.enter(Operation::LookupBrokerToken)?;
        Ok(state.broker_token.clone().unwrap_or(TokenLookup {
            accessor: "root".to_string(),
            ttl_secs: 0,
            renewable: false,
            expires: false,
        }))
    }

    async fn renew_broker_token(&self) -> Result<RenewedLease> {
        let mut state = self.state.write();
        state.enter(Operation::RenewBrokerToken)?;
        let Some(lookup) = state.broker_token.clone() else {
            return Err(Error::backend("lease is not renewable"));
        };
        state.broker_renewals += 1;
        Ok(RenewedLease {
            lease_duration_secs: lookup.ttl_secs,
        })
    }

    async fn list_mounts(&self) -> Result<BTreeMap<String, String>> {
        let mut state = self.state.write();
        state.enter(Operation::ListMounts)?;
        Ok(state.mounts.clone())
    }

    async fn mount(&self, path: &str, kind: &str) -> Result<()> {
        let mut state = self.state.write();
        state.enter(Operation::Mount)?;
        let key = mount_key(path);
        if state.mounts.contains_key(&key) {
            return Err(Error::backend(format!(
                "existing mount at {key}: path is already in use"
            )));
        }
        state.mounts.insert(key, kind.to_string());
        Ok(())
    }

    async fn unmount(&self, path: &str) -> Result<()> {
        let mut state = self.state.write();
        state.enter(Operation::Unmount)?;
        let key = mount_key(path);
        if state.mounts.remove(&key).is_none() {
            return Err(Error::backend(format!("no matching mount at {key}")));
        }
        state.data.retain(|stored, _| !format!("{stored}/").starts_with(&key));
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Option<Data>> {
        let mut state = self.state.write();
        state.enter(Operation::Read)?;
        Ok(state.data.get(path.trim_matches('/')).cloned())
    }

    async fn write(&self, path: &str, data: Data) -> Result<()> {
        let mut state = self.state.write();
        state.enter(Operation::Write)?;
        let path = path.trim_matches('/');
        if !state.is_mounted(path) {
            return Err(Error::backend(format!("no handler for route '{path}'")));
        }
        state.data.insert(path.to_string(), data);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut state = self.state.write();
        state.enter(Operation::Delete)?;
        state.data.remove(path.trim_matches('/'));
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut state = self.state.write();
        state.enter(Operation::List)?;
        let dir = mount_key(prefix);
        let children: BTreeSet<String> = state
            .data
            .keys()
            .filter_map(|key| key.strip_prefix(dir.as_str()))
            .map(|rest| match rest.split_once('/') {
                Some((folder, _)) => format!("{folder}/"),
                None => rest.to_string(),
            })
            .collect();
        Ok(children.into_iter().collect())
    }
}

fn mount_key(path: &str) -> String {
    format!("{}/", path.trim_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: serde_json::Value) -> Data {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn listing_marks_folders() {
        let backend = DevBackend::new();
        backend.mount("cf/broker", "generic").await.unwrap();
        backend
            .write("cf/broker/inst", data(json!({"json": "{}"})))
            .await
            .unwrap();
        backend
            .write("cf/broker/inst/bind", data(json!({"json": "{}"})))
            .await
            .unwrap();

        assert_eq!(
            backend.list("cf/broker/").await.unwrap(),
            vec!["inst", "inst/"]
        );
        assert_eq!(backend.list("cf/broker/inst").await.unwrap(), vec!["bind"]);
        assert!(backend.list("cf/broker/other/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn writes_need_a_mount() {
        let backend = DevBackend::new();
        let err = backend
            .write("cf/broker/inst", Data::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no handler for route"));
    }

    #[tokio::test]
    async fn mounting_twice_fails() {
        let backend = DevBackend::new();
        backend.mount("/cf/i/transit/", "transit").await.unwrap();
        assert!(backend.mount("cf/i/transit", "transit").await.is_err());
        assert_eq!(
            backend.mounts().get("cf/i/transit/").map(String::as_str),
            Some("transit")
        );
    }

    #[tokio::test]
    async fn revoked_tokens_cannot_renew() {
        let backend = DevBackend::new().with_lease(60);
        backend
            .write_role(
                "cf-i",
                &TokenRole {
                    allowed_policies: vec!["cf-i".into()],
                    period: Duration::from_secs(60),
                    renewable: true,
                },
            )
            .await
            .unwrap();
        let issued = backend
            .create_credential(
                "cf-i",
                &CredentialRequest {
                    policies: vec!["cf-i".into()],
                    metadata: HashMap::new(),
                    display_name: "cf-bind-b".into(),
                    renewable: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(issued.lease_duration_secs, 60);

        let lease = backend.renew_self(&issued.token).await.unwrap();
        assert_eq!(lease.lease_duration_secs, 60);

        backend.revoke_accessor(&issued.accessor).await.unwrap();
        assert!(backend.renew_self(&issued.token).await.is_err());
        assert_eq!(backend.renewals(), 1);
    }

    #[tokio::test]
    async fn injected_failures_until_cleared() {
        let backend = DevBackend::new();
        backend.fail(Operation::ListMounts, "connection refused");
        assert_eq!(
            backend.list_mounts().await.unwrap_err().to_string(),
            "connection refused"
        );
        backend.clear_failure(Operation::ListMounts);
        assert!(backend.list_mounts().await.unwrap().contains_key("sys/"));
        assert_eq!(backend.calls(Operation::ListMounts), 2);
    }
}
