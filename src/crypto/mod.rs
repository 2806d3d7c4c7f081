//! Crypto glue around the external SDK.

pub mod digest;
pub mod dkg;
pub mod key_store;
pub mod provider;
pub mod ratchet_state;

pub use provider::{CryptoProvider, Envelope, Keypair};
pub use ratchet_state::{ConversationLocks, EncryptionState};
