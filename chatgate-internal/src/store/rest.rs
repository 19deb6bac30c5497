use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{DisplayOrDebugGateway, Error, ErrorDetails};
use crate::store::{
    ActivityRecord, AdminSettings, DataStore, DocumentRecord, ErrorLogRecord, PriorityUpdate,
    UserProfile,
};
use crate::usage_limit::{UsageCounts, UsageStore};

const DOCUMENT_COLUMNS: &str = "filename,mime_type,extracted_text";
const PROFILE_COLUMNS: &str = "full_name,email,phone,company";

/// Client for a PostgREST endpoint exposing the gateway's tables
#[derive(Clone)]
pub struct RestDataStore {
    base_url: Url,
    api_key: Option<SecretString>,
    http_client: reqwest::Client,
}

impl std::fmt::Debug for RestDataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestDataStore")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct UsageRow {
    #[serde(default)]
    daily_count: u64,
    #[serde(default)]
    monthly_count: u64,
}

#[derive(Debug, Serialize)]
struct IncrementUsageArgs<'a> {
    p_user_id: &'a str,
    p_feature: &'a str,
}

impl RestDataStore {
    pub fn new(base_url: Url, api_key: Option<SecretString>, http_client: reqwest::Client) -> Self {
        let mut base_url = base_url;
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }
        Self {
            base_url,
            api_key,
            http_client,
        }
    }

    fn table_url(&self, table: &str) -> Result<Url, Error> {
        self.base_url.join(table).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Invalid data store URL for `{table}`: {e}"),
            })
        })
    }

    fn request(&self, method: Method, table: &str) -> Result<RequestBuilder, Error> {
        let mut builder = self.http_client.request(method, self.table_url(table)?);
        if let Some(key) = &self.api_key {
            builder = builder
                .header("apikey", key.expose_secret())
                .bearer_auth(key.expose_secret());
        }
        Ok(builder)
    }

    async fn send(operation: &str, builder: RequestBuilder) -> Result<reqwest::Response, Error> {
        let response = builder.send().await.map_err(|e| {
            Error::new(ErrorDetails::DataStore {
                operation: operation.to_string(),
                message: DisplayOrDebugGateway::new(e).to_string(),
            })
        })?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(Error::new(ErrorDetails::DataStore {
            operation: operation.to_string(),
            message: format!("HTTP {status}: {body}"),
        }))
    }

    async fn fetch_rows<T: DeserializeOwned>(
        &self,
        operation: &str,
        builder: RequestBuilder,
    ) -> Result<Vec<T>, Error> {
        let response = Self::send(operation, builder).await?;
        response.json::<Vec<T>>().await.map_err(|e| {
            Error::new(ErrorDetails::DataStore {
                operation: operation.to_string(),
                message: format!("Error parsing response: {}", DisplayOrDebugGateway::new(e)),
            })
        })
    }

    async fn insert<T: Serialize + Sync>(&self, table: &str, row: &T) -> Result<(), Error> {
        let operation = format!("insert_{table}");
        let builder = self
            .request(Method::POST, table)?
            .header("Prefer", "return=minimal")
            .json(row);
        Self::send(&operation, builder).await.map(|_| ())
    }
}

#[async_trait]
impl DataStore for RestDataStore {
    async fn get_admin_settings(&self) -> Result<AdminSettings, Error> {
        let builder = self
            .request(Method::GET, "admin_settings")?
            .query(&[("select", "*"), ("limit", "1")]);
        let rows: Vec<AdminSettings> = self.fetch_rows("get_admin_settings", builder).await?;
        Ok(rows.into_iter().next().unwrap_or_default())
    }

    async fn list_global_documents(&self) -> Result<Vec<DocumentRecord>, Error> {
        let builder = self
            .request(Method::GET, "knowledge_documents")?
            .query(&[("select", DOCUMENT_COLUMNS), ("is_global", "eq.true")]);
        self.fetch_rows("list_global_documents", builder).await
    }

    async fn list_user_documents(&self, user_id: &str) -> Result<Vec<DocumentRecord>, Error> {
        let user_filter = format!("eq.{user_id}");
        let builder = self
            .request(Method::GET, "user_documents")?
            .query(&[("select", DOCUMENT_COLUMNS), ("user_id", user_filter.as_str())]);
        self.fetch_rows("list_user_documents", builder).await
    }

    async fn get_user_profile(&self, user_id: &str) -> Result<Option<UserProfile>, Error> {
        let id_filter = format!("eq.{user_id}");
        let builder = self.request(Method::GET, "profiles")?.query(&[
            ("select", PROFILE_COLUMNS),
            ("id", id_filter.as_str()),
            ("limit", "1"),
        ]);
        let rows: Vec<UserProfile> = self.fetch_rows("get_user_profile", builder).await?;
        Ok(rows.into_iter().next())
    }

    async fn update_conversation_priority(
        &self,
        conversation_id: &str,
        update: &PriorityUpdate,
    ) -> Result<(), Error> {
        let id_filter = format!("eq.{conversation_id}");
        let builder = self
            .request(Method::PATCH, "conversations")?
            .query(&[("id", &id_filter)])
            .header("Prefer", "return=minimal")
            .json(update);
        Self::send("update_conversation_priority", builder)
            .await
            .map(|_| ())
    }

    async fn insert_error_log(&self, record: &ErrorLogRecord) -> Result<(), Error> {
        self.insert("error_logs", record).await
    }

    async fn insert_activity_log(&self, record: &ActivityRecord) -> Result<(), Error> {
        self.insert("activity_logs", record).await
    }
}

/// Usage counters kept in the `usage_tracking` table. The store's
/// `increment_usage` function owns day and month rollover.
#[async_trait]
impl UsageStore for RestDataStore {
    async fn get_usage(&self, user_id: &str, feature: &str) -> Result<UsageCounts, Error> {
        let user_filter = format!("eq.{user_id}");
        let feature_filter = format!("eq.{feature}");
        let builder = self.request(Method::GET, "usage_tracking")?.query(&[
            ("select", "daily_count,monthly_count"),
            ("user_id", user_filter.as_str()),
            ("feature", feature_filter.as_str()),
            ("limit", "1"),
        ]);
        let rows: Vec<UsageRow> = self
            .fetch_rows("get_usage", builder)
            .await
            .map_err(|e| usage_error(&e))?;
        Ok(rows
            .into_iter()
            .next()
            .map(|row| UsageCounts {
                daily: row.daily_count,
                monthly: row.monthly_count,
            })
            .unwrap_or_default())
    }

    async fn increment_usage(&self, user_id: &str, feature: &str) -> Result<(), Error> {
        let builder = self
            .request(Method::POST, "rpc/increment_usage")?
            .json(&IncrementUsageArgs {
                p_user_id: user_id,
                p_feature: feature,
            });
        Self::send("increment_usage", builder)
            .await
            .map(|_| ())
            .map_err(|e| usage_error(&e))
    }
}

// The data store error was already logged; rewrap it without logging again.
fn usage_error(e: &Error) -> Error {
    Error::new_without_logging(ErrorDetails::UsageStore {
        message: e.to_string(),
    })
}
