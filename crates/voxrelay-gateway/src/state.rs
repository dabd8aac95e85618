//! Gateway shared state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use voxrelay_core::config::{Config, GatewayConfig, SessionConfig};

use crate::pipeline::SessionServices;
use crate::registry::SessionRegistry;

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub started_at: Instant,
    #[cfg(feature = "metrics")]
    pub prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl GatewayState {
    /// Build state from config; session settings are copied into `services`.
    pub fn new(config: Arc<Config>, mut services: SessionServices) -> Self {
        let gateway = config.gateway();
        let session = config.session();
        let reply = config.reply();

        services.emit_status = session.emit_status;
        services.inbound_queue = session.inbound_queue;
        services.max_utterance_bytes = session.max_utterance_bytes;
        services.history_turns = reply.history_turns.unwrap_or(20);
        services.reply_timeout = Duration::from_millis(reply.timeout_ms.unwrap_or(30_000));

        Self {
            registry: Arc::new(SessionRegistry::new(
                Arc::new(services),
                gateway.max_sessions,
            )),
            config,
            started_at: Instant::now(),
            #[cfg(feature = "metrics")]
            prometheus: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_prometheus(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    pub fn gateway(&self) -> GatewayConfig {
        self.config.gateway()
    }

    pub fn session(&self) -> SessionConfig {
        self.config.session()
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.session().close_grace_ms)
    }
}
