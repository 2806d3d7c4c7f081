//! Directory API client.
//!
//! The directory holds user registrations, space registrations and
//! manifests, hub membership and the public invite eval pool. Services talk
//! to it through [`DirectoryApi`] so tests can substitute a double.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

use crate::crypto::provider::{Envelope, UserRegistration};
use crate::error::{QuorumError, Result};
use crate::services::config::ApiSettings;
use crate::services::types::EncryptedMessage;

// ── Payloads ───────────────────────────────────────────────────

/// Signed registration binding a space address to its config and owner keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpaceRegistration {
    pub space_address: String,
    pub space_public_key: String,
    pub space_signature: String,
    pub config_public_key: String,
    #[serde(default)]
    pub owner_public_keys: Vec<String>,
    #[serde(default)]
    pub owner_signatures: Vec<String>,
    pub timestamp: i64,
}

/// Space JSON sealed to the config key, signed by an owner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpaceManifest {
    pub space_address: String,
    /// Serialized ciphertext object from `encrypt_inbox_message`.
    pub space_manifest: String,
    pub ephemeral_public_key: String,
    pub timestamp: i64,
    pub owner_public_key: String,
    pub owner_signature: String,
}

/// Hub membership change, countersigned by hub and inbox keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HubControlMessage {
    pub hub_address: String,
    pub hub_public_key: String,
    pub hub_signature: String,
    pub inbox_public_key: String,
    pub inbox_signature: String,
}

/// Batch of single-use public invite payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpaceInviteEvals {
    pub config_public_key: String,
    pub space_address: String,
    pub space_evals: Vec<String>,
    pub ephemeral_public_key: String,
    pub owner_public_key: String,
    pub owner_signature: String,
}

/// Encrypted, signed user config blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserConfigPayload {
    pub user_address: String,
    pub user_public_key: String,
    /// hex(ciphertext) || hex(iv)
    pub user_config: String,
    pub timestamp: i64,
    pub signature: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteMessages {
    pub inbox_address: String,
    pub timestamps: Vec<i64>,
    pub inbox_public_key: String,
    pub inbox_signature: String,
}

#[derive(Debug, Clone, Deserialize)]
struct InboxEntry {
    timestamp: i64,
    #[serde(flatten)]
    sealed: Envelope,
}

#[async_trait]
pub trait DirectoryApi: Send + Sync {
    async fn get_user(&self, address: &str) -> Result<UserRegistration>;
    async fn get_user_settings(&self, address: &str) -> Result<Option<UserConfigPayload>>;
    async fn post_user_settings(&self, address: &str, payload: &UserConfigPayload) -> Result<()>;

    async fn get_space(&self, address: &str) -> Result<SpaceRegistration>;
    async fn post_space(&self, address: &str, registration: &SpaceRegistration) -> Result<()>;
    async fn get_space_manifest(&self, address: &str) -> Result<SpaceManifest>;
    async fn post_space_manifest(&self, address: &str, manifest: &SpaceManifest) -> Result<()>;

    async fn post_hub_add(&self, message: &HubControlMessage) -> Result<()>;
    async fn post_hub_delete(&self, message: &HubControlMessage) -> Result<()>;

    async fn post_space_invite_evals(&self, evals: &SpaceInviteEvals) -> Result<()>;
    /// Claim one eval from the public pool. Returns the ciphertext string.
    async fn get_space_invite_eval(&self, config_public_key_hex: &str) -> Result<String>;

    async fn get_inbox(&self, address: &str) -> Result<Vec<EncryptedMessage>>;
    async fn delete_inbox(&self, messages: &DeleteMessages) -> Result<()>;
}

// ── HTTP implementation ────────────────────────────────────────

pub struct HttpDirectoryClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDirectoryClient {
    pub fn new(settings: &ApiSettings) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(settings.request_timeout_secs))
                .build()
                .unwrap_or_default(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.client.get(self.url(path)).send().await?;
        Self::decode(path, response).await
    }

    async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        Self::decode(path, response).await
    }

    /// POST where only the status matters; the `{status}` body is ignored.
    async fn post_status<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<()> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        Self::check(path, response).await.map(|_| ())
    }

    async fn check(path: &str, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            log::warn!("Directory request {} failed: HTTP {}", path, status);
            return Err(QuorumError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(path: &str, response: reqwest::Response) -> Result<T> {
        Self::check(path, response)
            .await?
            .json()
            .await
            .map_err(|e| QuorumError::Network(format!("Failed to parse {} response: {}", path, e)))
    }
}

#[async_trait]
impl DirectoryApi for HttpDirectoryClient {
    async fn get_user(&self, address: &str) -> Result<UserRegistration> {
        self.get_json(&format!("/users/{}", address)).await
    }

    async fn get_user_settings(&self, address: &str) -> Result<Option<UserConfigPayload>> {
        match self.get_json(&format!("/users/{}/config", address)).await {
            Ok(payload) => Ok(Some(payload)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn post_user_settings(&self, address: &str, payload: &UserConfigPayload) -> Result<()> {
        self.post_status(&format!("/users/{}/config", address), payload)
            .await
    }

    async fn get_space(&self, address: &str) -> Result<SpaceRegistration> {
        self.get_json(&format!("/spaces/{}", address)).await
    }

    async fn post_space(&self, address: &str, registration: &SpaceRegistration) -> Result<()> {
        self.post_status(&format!("/spaces/{}", address), registration)
            .await
    }

    async fn get_space_manifest(&self, address: &str) -> Result<SpaceManifest> {
        self.get_json(&format!("/spaces/{}/manifest", address)).await
    }

    async fn post_space_manifest(&self, address: &str, manifest: &SpaceManifest) -> Result<()> {
        self.post_status(&format!("/spaces/{}/manifest", address), manifest)
            .await
    }

    async fn post_hub_add(&self, message: &HubControlMessage) -> Result<()> {
        self.post_status("/hub/add", message).await
    }

    async fn post_hub_delete(&self, message: &HubControlMessage) -> Result<()> {
        self.post_status("/hub/delete", message).await
    }

    async fn post_space_invite_evals(&self, evals: &SpaceInviteEvals) -> Result<()> {
        self.post_status("/invite/evals", evals).await
    }

    async fn get_space_invite_eval(&self, config_public_key_hex: &str) -> Result<String> {
        self.post_json(
            "/invite/eval",
            &serde_json::json!({ "config_public_key": config_public_key_hex }),
        )
        .await
    }

    async fn get_inbox(&self, address: &str) -> Result<Vec<EncryptedMessage>> {
        let entries: Vec<InboxEntry> = self.get_json(&format!("/inbox/{}", address)).await?;
        entries
            .into_iter()
            .map(|entry| {
                Ok(EncryptedMessage {
                    inbox_address: address.to_string(),
                    encrypted_content: serde_json::to_string(&entry.sealed)?,
                    timestamp: entry.timestamp,
                })
            })
            .collect()
    }

    async fn delete_inbox(&self, messages: &DeleteMessages) -> Result<()> {
        self.post_status("/inbox/delete", messages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> HttpDirectoryClient {
        HttpDirectoryClient::new(&ApiSettings {
            base_url: format!("{}/", server.uri()),
            request_timeout_secs: 5,
        })
    }

    #[tokio::test]
    async fn test_get_space_registration() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/spaces/QmSpace"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "space_address": "QmSpace",
                "space_public_key": "aa",
                "space_signature": "bb",
                "config_public_key": "cc",
                "owner_public_keys": ["dd"],
                "owner_signatures": ["ee"],
                "timestamp": 7
            })))
            .mount(&server)
            .await;

        let reg = client_for(&server).get_space("QmSpace").await.unwrap();
        assert_eq!(reg.owner_public_keys, vec!["dd".to_string()]);
        assert_eq!(reg.timestamp, 7);
    }

    #[tokio::test]
    async fn test_invite_eval_404_maps_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invite/eval"))
            .and(body_json(serde_json::json!({ "config_public_key": "abcd" })))
            .respond_with(ResponseTemplate::new(404).set_body_string("exhausted"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .get_space_invite_eval("abcd")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_post_hub_add_sends_payload() {
        let server = MockServer::start().await;
        let msg = HubControlMessage {
            hub_address: "QmHub".into(),
            hub_public_key: "01".into(),
            hub_signature: "02".into(),
            inbox_public_key: "03".into(),
            inbox_signature: "04".into(),
        };
        Mock::given(method("POST"))
            .and(path("/hub/add"))
            .and(body_json(serde_json::to_value(&msg).unwrap()))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "ok"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server).post_hub_add(&msg).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_user_settings_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/QmUser/config"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(client_for(&server)
            .get_user_settings("QmUser")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_inbox_entries_become_encrypted_messages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/inbox/QmInbox"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"timestamp": 11, "envelope": "x"}
            ])))
            .mount(&server)
            .await;

        let items = client_for(&server).get_inbox("QmInbox").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].timestamp, 11);
        assert_eq!(items[0].inbox_address, "QmInbox");
        let sealed: serde_json::Value = serde_json::from_str(&items[0].encrypted_content).unwrap();
        assert_eq!(sealed["envelope"], "x");
    }
}
