use serde::{Deserialize, Serialize};
use serde_json::Value;
use vault_broker_core::{Credentials, OperationState};

use crate::config::BrokerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogResponse {
    pub services: Vec<ServiceOffering>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceOffering {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub bindable: bool,
    pub plan_updateable: bool,
    pub plans: Vec<ServicePlan>,
    pub metadata: ServiceMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetadata {
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub long_description: String,
    pub provider_display_name: String,
    pub documentation_url: String,
    pub support_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicePlan {
    pub id: String,
    pub name: String,
    pub description: String,
    pub free: bool,
    pub metadata: PlanMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanMetadata {
    pub display_name: String,
    pub bullets: Vec<String>,
}

impl CatalogResponse {
    /// The single service and plan this broker offers.
    pub fn from_config(config: &BrokerConfig) -> Self {
        let plan = ServicePlan {
            id: format!("{}.{}", config.service_id, config.plan_name),
            name: config.plan_name.clone(),
            description: config.plan_description.clone(),
            free: true,
            metadata: PlanMetadata {
                display_name: config.plan_metadata_name.clone(),
                bullets: config.plan_bullets.clone(),
            },
        };
        Self {
            services: vec![ServiceOffering {
                id: config.service_id.clone(),
                name: config.service_name.clone(),
                description: config.service_description.clone(),
                tags: config.service_tags.clone(),
                bindable: true,
                plan_updateable: false,
                plans: vec![plan],
                metadata: ServiceMetadata {
                    display_name: config.display_name.clone(),
                    image_url: config.image_url.clone(),
                    long_description: config.long_description.clone(),
                    provider_display_name: config.provider_display_name.clone(),
                    documentation_url: config.documentation_url.clone(),
                    support_url: config.support_url.clone(),
                },
            }],
        }
    }
}

/// Platform context sent alongside provisioning requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformContext {
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub organization_guid: Option<String>,
    #[serde(default)]
    pub space_guid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub service_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub organization_guid: Option<String>,
    #[serde(default)]
    pub space_guid: Option<String>,
    #[serde(default)]
    pub context: Option<PlatformContext>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

impl ProvisionRequest {
    /// Organization and space, preferring the top-level fields over `context`.
    pub fn placement(&self) -> (String, String) {
        let context = self.context.clone().unwrap_or_default();
        let organization = self
            .organization_guid
            .clone()
            .filter(|value| !value.is_empty())
            .or(context.organization_guid)
            .unwrap_or_default();
        let space = self
            .space_guid
            .clone()
            .filter(|value| !value.is_empty())
            .or(context.space_guid)
            .unwrap_or_default();
        (organization, space)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub service_id: String,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindResource {
    #[serde(default)]
    pub app_guid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindRequest {
    pub service_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub bind_resource: Option<BindResource>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindResponse {
    pub credentials: Credentials,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastOperationResponse {
    pub state: OperationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyResponse {}
