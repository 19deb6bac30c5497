//! The hosted data store behind the gateway.
//!
//! We only need simple reads and writes from it, so it is modelled as a
//! narrow trait with an in-process implementation and a PostgREST client.

pub mod memory;
pub mod rest;

pub use memory::InMemoryDataStore;
pub use rest::RestDataStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Error;
use crate::postprocess::PriorityLevel;
use crate::telemetry::Severity;

/// Admin-managed AI configuration (a single row)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AdminSettings {
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// When set, turns go through the stateful thread/run workflow
    #[serde(default)]
    pub assistant_id: Option<String>,
    #[serde(default, skip_serializing, deserialize_with = "deserialize_secret")]
    pub api_key: Option<SecretString>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub company_name: Option<String>,
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value
        .filter(|key| !key.trim().is_empty())
        .map(SecretString::from))
}

impl AdminSettings {
    /// Blank strings in the admin UI mean "not configured"
    pub fn assistant_id(&self) -> Option<&str> {
        self.assistant_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DocumentRecord {
    pub filename: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub extracted_text: Option<String>,
}

impl DocumentRecord {
    pub fn new(
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        text: Option<&str>,
    ) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            extracted_text: text.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserProfile {
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriorityUpdate {
    pub priority_score: u8,
    pub priority_level: PriorityLevel,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorLogRecord {
    pub id: Uuid,
    pub severity: Severity,
    pub message: String,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityRecord {
    pub id: Uuid,
    pub user_id: String,
    pub action: String,
    pub details: serde_json::Value,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait DataStore: Send + Sync {
    async fn get_admin_settings(&self) -> Result<AdminSettings, Error>;

    async fn list_global_documents(&self) -> Result<Vec<DocumentRecord>, Error>;

    async fn list_user_documents(&self, user_id: &str) -> Result<Vec<DocumentRecord>, Error>;

    async fn get_user_profile(&self, user_id: &str) -> Result<Option<UserProfile>, Error>;

    async fn update_conversation_priority(
        &self,
        conversation_id: &str,
        update: &PriorityUpdate,
    ) -> Result<(), Error>;

    async fn insert_error_log(&self, record: &ErrorLogRecord) -> Result<(), Error>;

    async fn insert_activity_log(&self, record: &ActivityRecord) -> Result<(), Error>;
}

/// Short-lived cache in front of [`DataStore::get_admin_settings`]
#[derive(Clone)]
pub struct AdminSettingsCache {
    store: Arc<dyn DataStore>,
    cache: Cache<(), Arc<AdminSettings>>,
}

impl std::fmt::Debug for AdminSettingsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminSettingsCache").finish_non_exhaustive()
    }
}

impl AdminSettingsCache {
    pub fn new(store: Arc<dyn DataStore>, ttl: Duration) -> Self {
        let cache = Cache::builder().max_capacity(1).time_to_live(ttl).build();
        Self { store, cache }
    }

    pub async fn get(&self) -> Result<Arc<AdminSettings>, Error> {
        let store = Arc::clone(&self.store);
        self.cache
            .try_get_with((), async move { store.get_admin_settings().await.map(Arc::new) })
            .await
            .map_err(|e: Arc<Error>| {
                Error::new_without_logging(crate::error::ErrorDetails::DataStore {
                    operation: "get_admin_settings".to_string(),
                    message: e.to_string(),
                })
            })
    }

    pub async fn invalidate(&self) {
        self.cache.invalidate(&()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_assistant_id_is_unset() {
        let settings = AdminSettings {
            assistant_id: Some("   ".to_string()),
            ..Default::default()
        };
        assert_eq!(settings.assistant_id(), None);

        let settings = AdminSettings {
            assistant_id: Some(" asst_1 ".to_string()),
            ..Default::default()
        };
        assert_eq!(settings.assistant_id(), Some("asst_1"));
    }

    #[test]
    fn test_admin_settings_deserialize_with_missing_fields() {
        let settings: AdminSettings =
            serde_json::from_value(serde_json::json!({"model": "gpt-4o", "api_key": "sk-1"}))
                .unwrap();
        assert_eq!(settings.model.as_deref(), Some("gpt-4o"));
        assert!(settings.api_key.is_some());
        assert!(settings.system_prompt.is_none());
    }

    #[tokio::test]
    async fn test_settings_cache_serves_cached_copy() {
        let store = Arc::new(InMemoryDataStore::new().with_admin_settings(AdminSettings {
            model: Some("gpt-4o".to_string()),
            ..Default::default()
        }));
        let cache = AdminSettingsCache::new(store.clone(), Duration::from_secs(60));
        assert_eq!(cache.get().await.unwrap().model.as_deref(), Some("gpt-4o"));

        store.set_admin_settings(AdminSettings {
            model: Some("gpt-5".to_string()),
            ..Default::default()
        });
        assert_eq!(cache.get().await.unwrap().model.as_deref(), Some("gpt-4o"));

        cache.invalidate().await;
        assert_eq!(cache.get().await.unwrap().model.as_deref(), Some("gpt-5"));
    }

    #[tokio::test]
    async fn test_settings_cache_does_not_cache_failures() {
        let store = Arc::new(InMemoryDataStore::new());
        store.set_unavailable(true);
        let cache = AdminSettingsCache::new(store.clone(), Duration::from_secs(60));
        assert!(cache.get().await.is_err());

        store.set_unavailable(false);
        assert!(cache.get().await.is_ok());
    }
}
