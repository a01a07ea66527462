use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use vault_broker_core::{BrokerSettings, RenewalSettings, SharedBackend};

const DEFAULT_PORT: &str = ":8000";
const DEFAULT_SERVICE_ID: &str = "0654695e-0760-a1d4-1cad-5dd87b75ed99";
const DEFAULT_VAULT_ADDR: &str = "https://127.0.0.1:8200";
const DEFAULT_SERVICE_NAME: &str = "hashicorp-vault";
const DEFAULT_SERVICE_DESCRIPTION: &str = "HashiCorp Vault Service Broker";
const DEFAULT_PLAN_NAME: &str = "shared";
const DEFAULT_PLAN_DESCRIPTION: &str = "Secure access to Vault's storage and transit backends";
const DEFAULT_PLAN_METADATA_NAME: &str = "Architecture and Assumptions";
const DEFAULT_PLAN_BULLETS: &str = "The Vault server is already running and is accessible by the broker.,\
The Vault server may be used by other applications (it is not exclusively tied to Cloud Foundry).,\
All instances of an application will share a token.,\
Any Vault operations performed outside of Cloud Foundry will require users to rebind their instances.";
const DEFAULT_DISPLAY_NAME: &str = "Vault for PCF";
const DEFAULT_LONG_DESCRIPTION: &str = "The official HashiCorp Vault broker integration to the Open Service Broker API. \
This service broker provides support for secure secret storage and encryption-as-a-service to HashiCorp Vault.";
const DEFAULT_PROVIDER_DISPLAY_NAME: &str = "HashiCorp";
const DEFAULT_DOCUMENTATION_URL: &str = "https://www.vaultproject.io/";
const DEFAULT_SUPPORT_URL: &str = "https://support.hashicorp.com/";
const DEFAULT_BACKEND: &str = "vault";
const DEFAULT_MOUNT_PREFIX: &str = "cf";
const DEFAULT_RENEWAL_BACKOFF_SECS: u64 = 30;

/// Broker configuration, read from the environment.
#[derive(Clone)]
pub struct BrokerConfig {
    pub security_user_name: String,
    pub security_user_password: String,
    pub vault_token: String,

    pub port: String,
    pub service_id: String,
    pub vault_addr: String,
    pub vault_advertise_addr: String,
    pub vault_namespace: Option<String>,
    pub service_name: String,
    pub service_description: String,
    pub service_tags: Vec<String>,
    pub plan_name: String,
    pub plan_description: String,
    pub plan_metadata_name: String,
    pub plan_bullets: Vec<String>,
    pub display_name: String,
    pub image_url: Option<String>,
    pub long_description: String,
    pub provider_display_name: String,
    pub documentation_url: String,
    pub support_url: String,
    pub vault_renew: bool,

    /// `vault` or `dev`.
    pub backend: String,
    pub mount_prefix: String,
    pub renewal_backoff: Duration,
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read every setting through `lookup`, applying defaults. Empty values
    /// count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.is_empty());
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let vault_renew = match get("VAULT_RENEW") {
            Some(value) => parse_bool(&value).with_context(|| format!("invalid VAULT_RENEW `{value}`"))?,
            None => true,
        };
        let renewal_backoff = match get("BROKER_RENEWAL_BACKOFF_SECS") {
            Some(value) => value
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .ok_or_else(|| anyhow!("invalid BROKER_RENEWAL_BACKOFF_SECS `{value}`"))?,
            None => Duration::from_secs(DEFAULT_RENEWAL_BACKOFF_SECS),
        };

        Ok(Self {
            security_user_name: or("SECURITY_USER_NAME", ""),
            security_user_password: or("SECURITY_USER_PASSWORD", ""),
            vault_token: or("VAULT_TOKEN", ""),
            port: or("PORT", DEFAULT_PORT),
            service_id: or("SERVICE_ID", DEFAULT_SERVICE_ID),
            vault_addr: or("VAULT_ADDR", DEFAULT_VAULT_ADDR),
            vault_advertise_addr: or("VAULT_ADVERTISE_ADDR", ""),
            vault_namespace: get("VAULT_NAMESPACE"),
            service_name: or("SERVICE_NAME", DEFAULT_SERVICE_NAME),
            service_description: or("SERVICE_DESCRIPTION", DEFAULT_SERVICE_DESCRIPTION),
            service_tags: split_list(get("SERVICE_TAGS").as_deref().unwrap_or_default()),
            plan_name: or("PLAN_NAME", DEFAULT_PLAN_NAME),
            plan_description: or("PLAN_DESCRIPTION", DEFAULT_PLAN_DESCRIPTION),
            plan_metadata_name: or("PLAN_METADATA_NAME", DEFAULT_PLAN_METADATA_NAME),
            plan_bullets: split_list(&or("PLAN_BULLETS", DEFAULT_PLAN_BULLETS)),
            display_name: or("DISPLAY_NAME", DEFAULT_DISPLAY_NAME),
            image_url: get("IMAGE_URL"),
            long_description: or("LONG_DESCRIPTION", DEFAULT_LONG_DESCRIPTION),
            provider_display_name: or("PROVIDER_DISPLAY_NAME", DEFAULT_PROVIDER_DISPLAY_NAME),
            documentation_url: or("DOCUMENTATION_URL", DEFAULT_DOCUMENTATION_URL),
            support_url: or("SUPPORT_URL", DEFAULT_SUPPORT_URL),
            vault_renew,
            backend: or("SECRETS_BACKEND", DEFAULT_BACKEND),
            mount_prefix: or("BROKER_MOUNT_PREFIX", DEFAULT_MOUNT_PREFIX),
            renewal_backoff,
        })
    }

    /// Reject missing credentials and fix up values that are merely sloppy.
    pub fn validate(mut self) -> Result<Self> {
        if self.security_user_name.is_empty() {
            bail!("missing SECURITY_USER_NAME");
        }
        if self.security_user_password.is_empty() {
            bail!("missing SECURITY_USER_PASSWORD");
        }
        if self.backend == "vault" && self.vault_token.is_empty() {
            bail!("missing VAULT_TOKEN");
        }

        if !self.port.starts_with(':') && !self.port.contains(':') {
            self.port = format!(":{}", self.port);
        }
        if self.vault_advertise_addr.is_empty() {
            self.vault_advertise_addr = self.vault_addr.clone();
        }
        self.vault_addr = normalize_addr(&self.vault_addr);
        self.vault_advertise_addr = normalize_addr(&self.vault_advertise_addr);
        Ok(self)
    }

    /// Socket address for `PORT`; a bare `:port` listens on every interface.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let addr = match self.port.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => self.port.clone(),
        };
        addr.parse()
            .with_context(|| format!("invalid PORT `{}`", self.port))
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            mount_prefix: self.mount_prefix.clone(),
            renewal: RenewalSettings {
                backoff: self.renewal_backoff,
                ..RenewalSettings::default()
            },
            advertise_addr: self.vault_advertise_addr.clone(),
            renew_broker_token: self.vault_renew,
            ..BrokerSettings::default()
        }
    }
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("security_user_name", &self.security_user_name)
            .field("port", &self.port)
            .field("service_id", &self.service_id)
            .field("service_name", &self.service_name)
            .field("plan_name", &self.plan_name)
            .field("vault_addr", &self.vault_addr)
            .field("vault_advertise_addr", &self.vault_advertise_addr)
            .field("vault_namespace", &self.vault_namespace)
            .field("vault_renew", &self.vault_renew)
            .field("backend", &self.backend)
            .field("mount_prefix", &self.mount_prefix)
            .finish_non_exhaustive()
    }
}

/// Ensure a scheme (https by default) and a trailing slash on the path.
pub fn normalize_addr(addr: &str) -> String {
    if addr.is_empty() {
        return String::new();
    }
    let (scheme, rest) = addr.split_once("://").unwrap_or(("https", addr));
    let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
    let path = path.trim_end_matches('/');
    if path.is_empty() {
        format!("{scheme}://{host}/")
    } else {
        format!("{scheme}://{host}/{path}/")
    }
}

/// Construct the backend named by `config.backend`.
pub fn load_backend(config: &BrokerConfig) -> Result<SharedBackend> {
    match config.backend.as_str() {
        "dev" => Ok(Arc::new(vault_broker_provider_dev::DevBackend::new())),
        "vault" => {
            let provider = vault_broker_provider_vault::VaultProviderConfig::from_env()
                .context("failed to configure vault backend")?
                .with_addr(config.vault_addr.clone())
                .with_namespace(config.vault_namespace.clone());
            let backend = vault_broker_provider_vault::VaultBackend::new(provider)
                .context("failed to initialize vault backend")?;
            Ok(Arc::new(backend))
        }
        other => Err(anyhow!("unsupported backend `{other}`")),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Ok(true),
        "0" | "f" | "false" => Ok(false),
        _ => bail!("expected a boolean"),
    }
}
