/// Injectable time source.
pub mod clock;
/// Broadcast hub for presence events.
pub mod events;
/// Connection states and legal transitions.
pub mod state_machine;

use std::sync::Arc;

use crate::{dao::connection_store::ConnectionStore, services::presence_service::PresenceService};

use self::events::PresenceEvents;

/// Shared handle to the application state.
pub type SharedState = Arc<AppState>;

/// Central application state shared by every HTTP handler.
pub struct AppState {
    presence: Arc<PresenceService>,
    events: Arc<PresenceEvents>,
    store: Arc<dyn ConnectionStore>,
    storage_backend: &'static str,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    pub fn new(
        presence: Arc<PresenceService>,
        events: Arc<PresenceEvents>,
        store: Arc<dyn ConnectionStore>,
        storage_backend: &'static str,
    ) -> SharedState {
        Arc::new(Self {
            presence,
            events,
            store,
            storage_backend,
        })
    }

    /// Presence facade.
    pub fn presence(&self) -> &PresenceService {
        &self.presence
    }

    /// Broadcast hub used for the presence SSE stream.
    pub fn events(&self) -> &PresenceEvents {
        &self.events
    }

    /// Connection store, for health checks.
    pub fn store(&self) -> &Arc<dyn ConnectionStore> {
        &self.store
    }

    /// Name of the installed store backend.
    pub fn storage_backend(&self) -> &'static str {
        self.storage_backend
    }
}
