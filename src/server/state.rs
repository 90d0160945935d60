use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::dispatcher::Dispatcher;
use crate::inbound::{InboundHandler, LoggingInboundHandler};
use crate::registry::SubscriptionRegistry;
use crate::supervisor::Supervisor;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: Arc<SubscriptionRegistry>,
    pub supervisor: Arc<Supervisor>,
    pub dispatcher: Arc<Dispatcher>,
    pub inbound: Arc<dyn InboundHandler>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new(
            settings.gateway.max_subscriptions_per_connection,
        ));
        let supervisor = Arc::new(Supervisor::new(settings.gateway.clone(), registry.clone()));
        let dispatcher = Arc::new(Dispatcher::new(supervisor.clone()));

        Self {
            settings: Arc::new(settings),
            registry,
            supervisor,
            dispatcher,
            inbound: Arc::new(LoggingInboundHandler),
            started_at: Instant::now(),
        }
    }

    /// Replace the default logging handler for client messages
    pub fn with_inbound_handler(mut self, handler: Arc<dyn InboundHandler>) -> Self {
        self.inbound = handler;
        self
    }
}
