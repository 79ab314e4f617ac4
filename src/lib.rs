use std::sync::Arc;

use config::Config;
use governance::governor::RequestGovernor;
use governance::upstream::UpstreamCaller;
use policy::PolicyStore;

pub mod api;
pub mod config;
pub mod error;
pub mod governance;
pub mod middleware;
pub mod policy;
pub mod routes;
pub mod utils;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub policies: Arc<PolicyStore>,
    pub governor: Arc<RequestGovernor>,
    pub upstream: Arc<dyn UpstreamCaller>,
}
