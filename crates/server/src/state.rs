use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use refactory_core::{ConfirmationChannel, ProgressBus, SessionStore};
use refactory_provider::ModelRouter;

/// Shared transport state: the session registry plus per-session progress
/// buses and confirmation channels. Buses and channels are evicted when
/// their stream closes; the sessions themselves live until process exit so
/// the status endpoint keeps serving terminal snapshots.
pub struct AppState {
    pub config: Arc<refactory_config::Config>,
    pub router: Arc<ModelRouter>,
    pub sessions: Arc<SessionStore>,
    buses: RwLock<HashMap<String, Arc<ProgressBus>>>,
    confirmations: RwLock<HashMap<String, Arc<ConfirmationChannel>>>,
}

impl AppState {
    pub fn new(config: refactory_config::Config) -> Self {
        let router = Arc::new(ModelRouter::from_config(&config));
        Self {
            config: Arc::new(config),
            router,
            sessions: Arc::new(SessionStore::new()),
            buses: RwLock::new(HashMap::new()),
            confirmations: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_bus(&self, session_id: &str) -> Arc<ProgressBus> {
        let bus = Arc::new(ProgressBus::new());
        if let Ok(mut buses) = self.buses.write() {
            buses.insert(session_id.to_string(), bus.clone());
        }
        bus
    }

    pub fn bus(&self, session_id: &str) -> Option<Arc<ProgressBus>> {
        self.buses.read().ok()?.get(session_id).cloned()
    }

    pub fn register_confirmation(&self, session_id: &str) -> Arc<ConfirmationChannel> {
        let channel = Arc::new(ConfirmationChannel::new());
        if let Ok(mut channels) = self.confirmations.write() {
            channels.insert(session_id.to_string(), channel.clone());
        }
        channel
    }

    pub fn confirmation(&self, session_id: &str) -> Option<Arc<ConfirmationChannel>> {
        self.confirmations.read().ok()?.get(session_id).cloned()
    }

    /// Drop the session's transport plumbing after its stream closes.
    /// Reconnecting afterwards is not supported; only the status endpoint
    /// remains.
    pub fn evict_transport(&self, session_id: &str) {
        if let Ok(mut buses) = self.buses.write() {
            if let Some(bus) = buses.remove(session_id) {
                bus.evict();
            }
        }
        if let Ok(mut channels) = self.confirmations.write() {
            channels.remove(session_id);
        }
    }
}
