// Service layer - messaging, spaces and sync over the crypto provider and store traits

pub mod action_handlers;
pub mod action_queue;
pub mod api_client;
pub mod backup;
pub mod config;
pub mod encryption_service;
pub mod hub;
pub mod invitation_service;
pub mod message_cache;
pub mod message_service;
pub mod message_store;
pub mod message_validation;
pub mod space_control;
pub mod space_service;
pub mod space_sessions;
pub mod sync_service;
pub mod transport;
pub mod types;
pub mod user_config;

pub use action_queue::ActionQueue;
pub use api_client::{DirectoryApi, HttpDirectoryClient};
pub use backup::BackupService;
pub use config::ConfigService;
pub use encryption_service::EncryptionService;
pub use invitation_service::InvitationService;
pub use message_service::MessageService;
pub use message_store::{FileStore, MemoryStore, MessageStore};
pub use space_service::SpaceService;
pub use sync_service::SyncService;
pub use user_config::UserConfigService;
