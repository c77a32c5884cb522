use std::sync::Arc;

use channel_transport::ChannelHub;
use server_api::ApiContext;
use storage::Storage;

use crate::{auth::SessionKeys, config::Settings};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) storage: Storage,
    pub(crate) hub: ChannelHub,
    pub(crate) sessions: SessionKeys,
}

impl AppState {
    pub(crate) fn new(storage: Storage, settings: &Settings) -> Self {
        let hub = ChannelHub::new();
        let api = ApiContext::new(storage.clone(), Arc::new(hub.clone()))
            .with_limits(settings.api_limits());
        Self {
            api,
            storage,
            hub,
            sessions: SessionKeys::new(&settings.session_secret, settings.session_ttl_seconds),
        }
    }
}
