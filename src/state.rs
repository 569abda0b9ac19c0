use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::orchestrator::RequestOrchestrator;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<RequestOrchestrator>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Arc<Config>, orchestrator: RequestOrchestrator) -> Self {
        AppState {
            config,
            orchestrator: Arc::new(orchestrator),
            started_at: Instant::now(),
        }
    }

    pub fn uptime_hours(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64() / 3600.0
    }
}
