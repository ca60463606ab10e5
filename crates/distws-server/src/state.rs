use std::sync::Arc;

use distws_core::DistributionManager;

use crate::auth::{AllowAll, Authenticator, TokenAuthenticator};
use crate::config::ServerConfig;

/// Application state shared across all routes
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<DistributionManager>,
    pub auth: Arc<dyn Authenticator>,
    pub config: ServerConfig,
}

impl AppState {
    /// Build state around a manager, picking the authenticator from the
    /// configured tokens.
    pub fn new(config: ServerConfig, manager: Arc<DistributionManager>) -> Self {
        let auth: Arc<dyn Authenticator> = match &config.tokens {
            Some(list) => Arc::new(TokenAuthenticator::from_list(list)),
            None => Arc::new(AllowAll),
        };

        Self {
            manager,
            auth,
            config,
        }
    }
}
