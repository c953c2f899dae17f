//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;
use stockroom_billing::{BillingService, UserStore};

use crate::auth::{AuthState, JwtManager};
use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub jwt: JwtManager,
    pub users: Arc<dyn UserStore>,
    /// `None` when billing is switched off with `ENABLE_BILLING=false`
    pub billing: Option<BillingService>,
}

impl AppState {
    pub fn new(
        config: Config,
        pool: PgPool,
        users: Arc<dyn UserStore>,
        billing: Option<BillingService>,
    ) -> Self {
        let jwt = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);
        Self {
            pool,
            config: Arc::new(config),
            jwt,
            users,
            billing,
        }
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt: self.jwt.clone(),
        }
    }
}
