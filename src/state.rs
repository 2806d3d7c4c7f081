use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::crypto::provider::CryptoProvider;
use crate::crypto::ratchet_state::ConversationLocks;
use crate::error::Result;
use crate::services::action_handlers::register_handlers;
use crate::services::action_queue::ActionQueue;
use crate::services::api_client::{DirectoryApi, HttpDirectoryClient};
use crate::services::backup::BackupService;
use crate::services::config::AppConfig;
use crate::services::encryption_service::EncryptionService;
use crate::services::hub::HubRelay;
use crate::services::invitation_service::{InvitationService, InvitationServiceDeps};
use crate::services::message_cache::MessageCache;
use crate::services::message_service::{MessageService, MessageServiceDeps};
use crate::services::message_store::{FileStore, MessageStore};
use crate::services::message_validation::MessageValidator;
use crate::services::space_service::{SpaceService, SpaceServiceDeps};
use crate::services::space_sessions::SpaceSessions;
use crate::services::sync_service::SyncService;
use crate::services::transport::{run_inbound, run_outbound, FrameSink, InboundHandler, OutboundQueue};
use crate::services::types::{EncryptedMessage, Identity};
use crate::services::user_config::UserConfigService;

/// Every service of a signed-in client, wired together.
pub struct AppState {
    pub config: AppConfig,
    pub identity: Arc<Identity>,
    pub store: Arc<dyn MessageStore>,
    pub api: Arc<dyn DirectoryApi>,
    pub outbound: Arc<OutboundQueue>,
    pub hub: Arc<HubRelay>,
    pub sessions: Arc<SpaceSessions>,
    pub cache: Arc<MessageCache>,
    pub user_config: Arc<UserConfigService>,
    pub sync: Arc<SyncService>,
    pub messages: Arc<MessageService>,
    pub spaces: Arc<SpaceService>,
    pub encryption: Arc<EncryptionService>,
    pub invitations: Arc<InvitationService>,
    pub action_queue: Arc<ActionQueue>,
    pub backup: Arc<BackupService>,
}

/// Background tasks started by [`AppState::start`].
pub struct Workers {
    pub action_queue: JoinHandle<()>,
    pub outbound: JoinHandle<()>,
    pub inbound: JoinHandle<()>,
}

impl Workers {
    pub fn abort(&self) {
        self.action_queue.abort();
        self.outbound.abort();
        self.inbound.abort();
    }
}

impl AppState {
    /// Open the on-disk store and the HTTP directory client named by
    /// `config`, then wire everything up.
    pub async fn open(
        config: AppConfig,
        identity: Identity,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Result<Self> {
        let data_dir = PathBuf::from(&config.storage.data_dir);
        let store: Arc<dyn MessageStore> = Arc::new(FileStore::open(&data_dir)?);
        let api: Arc<dyn DirectoryApi> = Arc::new(HttpDirectoryClient::new(&config.api));
        Ok(Self::build(config, identity, crypto, store, api, Some(data_dir)).await)
    }

    /// Wire services over the given collaborators. `data_dir` is where the
    /// action queue persists; `None` keeps it in memory.
    pub async fn build(
        config: AppConfig,
        identity: Identity,
        crypto: Arc<dyn CryptoProvider>,
        store: Arc<dyn MessageStore>,
        api: Arc<dyn DirectoryApi>,
        data_dir: Option<PathBuf>,
    ) -> Self {
        let identity = Arc::new(identity);
        let locks = Arc::new(ConversationLocks::new());
        let outbound = Arc::new(OutboundQueue::new());
        let sessions = Arc::new(SpaceSessions::new());
        let cache = Arc::new(MessageCache::new());
        let validator = Arc::new(MessageValidator::new(config.messaging.clone()));

        let hub = Arc::new(HubRelay::new(
            crypto.clone(),
            store.clone(),
            outbound.clone(),
            locks.clone(),
        ));
        let user_config = Arc::new(UserConfigService::new(
            identity.clone(),
            crypto.clone(),
            store.clone(),
            api.clone(),
            hub.clone(),
            sessions.clone(),
        ));
        let sync = Arc::new(SyncService::new(
            store.clone(),
            hub.clone(),
            sessions.clone(),
            config.sync.clone(),
        ));
        let messages = Arc::new(MessageService::new(MessageServiceDeps {
            identity: identity.clone(),
            crypto: crypto.clone(),
            store: store.clone(),
            api: api.clone(),
            hub: hub.clone(),
            sessions: sessions.clone(),
            sync: sync.clone(),
            user_config: user_config.clone(),
            cache: cache.clone(),
            validator,
            locks: locks.clone(),
            invites: config.invites.clone(),
        }));
        let spaces = Arc::new(SpaceService::new(SpaceServiceDeps {
            identity: identity.clone(),
            crypto: crypto.clone(),
            store: store.clone(),
            api: api.clone(),
            hub: hub.clone(),
            sessions: sessions.clone(),
            user_config: user_config.clone(),
            messages: messages.clone(),
            locks: locks.clone(),
            invites: config.invites.clone(),
            spare_shares: config.sync.public_invite_spares,
        }));
        let encryption = Arc::new(EncryptionService::new(
            crypto.clone(),
            store.clone(),
            api.clone(),
            sessions.clone(),
            user_config.clone(),
            spaces.clone(),
            identity.user_address.clone(),
        ));
        let invitations = Arc::new(InvitationService::new(InvitationServiceDeps {
            identity: identity.clone(),
            crypto,
            store: store.clone(),
            api: api.clone(),
            hub: hub.clone(),
            locks,
            user_config: user_config.clone(),
            messages: messages.clone(),
            spaces: spaces.clone(),
            sync: sync.clone(),
            invites: config.invites.clone(),
        }));

        let backup = Arc::new(BackupService::new(identity.clone(), store.clone()));

        let action_queue = Arc::new(ActionQueue::new(config.action_queue.clone(), data_dir));
        messages.set_action_queue(action_queue.clone());
        register_handlers(&action_queue, store.clone(), messages.clone(), spaces.clone()).await;

        log::info!("Client state ready for {}", identity.user_address);
        Self {
            config,
            identity,
            store,
            api,
            outbound,
            hub,
            sessions,
            cache,
            user_config,
            sync,
            messages,
            spaces,
            encryption,
            invitations,
            action_queue,
            backup,
        }
    }

    /// Start the action queue, the outbound flusher and the inbound loop.
    pub fn start(&self, sink: Arc<dyn FrameSink>, inbound: mpsc::Receiver<EncryptedMessage>) -> Workers {
        let handler: Arc<dyn InboundHandler> = self.messages.clone();
        Workers {
            action_queue: self.action_queue.clone().start(),
            outbound: tokio::spawn(run_outbound(
                self.outbound.clone(),
                sink,
                self.config.action_queue.poll_interval_ms,
            )),
            inbound: tokio::spawn(run_inbound(inbound, handler)),
        }
    }
}
