use std::sync::Arc;

use vault_broker_core::LifecycleManager;

use crate::auth::BasicCredentials;
use crate::models::CatalogResponse;

pub type SharedManager = Arc<LifecycleManager>;

#[derive(Clone)]
pub struct AppState {
    pub manager: SharedManager,
    pub catalog: Arc<CatalogResponse>,
    pub credentials: Arc<BasicCredentials>,
}

impl AppState {
    pub fn new(
        manager: SharedManager,
        catalog: CatalogResponse,
        credentials: BasicCredentials,
    ) -> Self {
        Self {
            manager,
            catalog: Arc::new(catalog),
            credentials: Arc::new(credentials),
        }
    }

    /// Id of the only service offered.
    pub fn service_id(&self) -> Option<&str> {
        self.catalog
            .services
            .first()
            .map(|service| service.id.as_str())
    }
}
