use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Error, ErrorDetails};
use crate::store::{
    ActivityRecord, AdminSettings, DataStore, DocumentRecord, ErrorLogRecord, PriorityUpdate,
    UserProfile,
};

/// Records kept per log table before the oldest are dropped
pub const DEFAULT_MAX_LOG_RECORDS: usize = 1_000;

#[derive(Debug, Default)]
struct Tables {
    admin_settings: AdminSettings,
    global_documents: Vec<DocumentRecord>,
    user_documents: HashMap<String, Vec<DocumentRecord>>,
    profiles: HashMap<String, UserProfile>,
    priority_updates: VecDeque<(String, PriorityUpdate)>,
    error_logs: VecDeque<ErrorLogRecord>,
    activity_logs: VecDeque<ActivityRecord>,
}

fn push_bounded<T>(table: &mut VecDeque<T>, record: T, max_records: usize) {
    while table.len() >= max_records.max(1) {
        table.pop_front();
    }
    table.push_back(record);
}

/// A data store held in process memory.
///
/// Used when no hosted store is configured, and as the recording store in tests.
/// Log tables are ring buffers holding the newest `max_log_records` entries.
/// `set_unavailable(true)` makes every call fail as if the store were down.
#[derive(Debug)]
pub struct InMemoryDataStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
    max_log_records: usize,
}

impl Default for InMemoryDataStore {
    fn default() -> Self {
        Self {
            tables: Mutex::default(),
            unavailable: AtomicBool::new(false),
            max_log_records: DEFAULT_MAX_LOG_RECORDS,
        }
    }
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_log_records(mut self, max_log_records: usize) -> Self {
        self.max_log_records = max_log_records;
        self
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        // Tables hold plain data, so a poisoned lock is still consistent
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self, operation: &str) -> Result<(), Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorDetails::DataStore {
                operation: operation.to_string(),
                message: "store unavailable".to_string(),
            }));
        }
        Ok(())
    }

    pub fn with_admin_settings(self, settings: AdminSettings) -> Self {
        self.set_admin_settings(settings);
        self
    }

    pub fn with_global_document(self, document: DocumentRecord) -> Self {
        self.tables().global_documents.push(document);
        self
    }

    pub fn with_user_document(self, user_id: &str, document: DocumentRecord) -> Self {
        self.tables()
            .user_documents
            .entry(user_id.to_string())
            .or_default()
            .push(document);
        self
    }

    pub fn with_user_profile(self, user_id: &str, profile: UserProfile) -> Self {
        self.tables().profiles.insert(user_id.to_string(), profile);
        self
    }

    pub fn set_admin_settings(&self, settings: AdminSettings) {
        self.tables().admin_settings = settings;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn error_logs(&self) -> Vec<ErrorLogRecord> {
        self.tables().error_logs.iter().cloned().collect()
    }

    pub fn activity_logs(&self) -> Vec<ActivityRecord> {
        self.tables().activity_logs.iter().cloned().collect()
    }

    pub fn priority_updates(&self) -> Vec<(String, PriorityUpdate)> {
        self.tables().priority_updates.iter().cloned().collect()
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn get_admin_settings(&self) -> Result<AdminSettings, Error> {
        self.check_available("get_admin_settings")?;
        Ok(self.tables().admin_settings.clone())
    }

    async fn list_global_documents(&self) -> Result<Vec<DocumentRecord>, Error> {
        self.check_available("list_global_documents")?;
        Ok(self.tables().global_documents.clone())
    }

    async fn list_user_documents(&self, user_id: &str) -> Result<Vec<DocumentRecord>, Error> {
        self.check_available("list_user_documents")?;
        Ok(self
            .tables()
            .user_documents
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_user_profile(&self, user_id: &str) -> Result<Option<UserProfile>, Error> {
        self.check_available("get_user_profile")?;
        Ok(self.tables().profiles.get(user_id).cloned())
    }

    async fn update_conversation_priority(
        &self,
        conversation_id: &str,
        update: &PriorityUpdate,
    ) -> Result<(), Error> {
        self.check_available("update_conversation_priority")?;
        push_bounded(
            &mut self.tables().priority_updates,
            (conversation_id.to_string(), update.clone()),
            self.max_log_records,
        );
        Ok(())
    }

    async fn insert_error_log(&self, record: &ErrorLogRecord) -> Result<(), Error> {
        self.check_available("insert_error_log")?;
        push_bounded(&mut self.tables().error_logs, record.clone(), self.max_log_records);
        Ok(())
    }

    async fn insert_activity_log(&self, record: &ActivityRecord) -> Result<(), Error> {
        self.check_available("insert_activity_log")?;
        push_bounded(&mut self.tables().activity_logs, record.clone(), self.max_log_records);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_user_documents_are_scoped_per_user() {
        let store = InMemoryDataStore::new()
            .with_user_document("u1", DocumentRecord::new("pricing.pdf", "application/pdf", None))
            .with_global_document(DocumentRecord::new("faq.txt", "text/plain", Some("FAQ")));

        assert_eq!(store.list_user_documents("u1").await.unwrap().len(), 1);
        assert!(store.list_user_documents("u2").await.unwrap().is_empty());
        assert_eq!(store.list_global_documents().await.unwrap().len(), 1);
    }

    fn activity(n: usize) -> ActivityRecord {
        ActivityRecord {
            id: uuid::Uuid::now_v7(),
            user_id: "u1".to_string(),
            action: "ai_chat".to_string(),
            details: serde_json::json!({ "turn": n }),
            success: true,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_log_tables_keep_only_newest_records() {
        let store = InMemoryDataStore::new().with_max_log_records(3);
        for n in 0..10 {
            store.insert_activity_log(&activity(n)).await.unwrap();
        }

        let turns: Vec<_> = store
            .activity_logs()
            .iter()
            .map(|record| record.details["turn"].as_u64().unwrap())
            .collect();
        assert_eq!(turns, vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn test_default_cap_bounds_long_running_store() {
        let store = InMemoryDataStore::new();
        for n in 0..DEFAULT_MAX_LOG_RECORDS + 500 {
            store.insert_activity_log(&activity(n)).await.unwrap();
        }
        assert_eq!(store.activity_logs().len(), DEFAULT_MAX_LOG_RECORDS);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = InMemoryDataStore::new();
        store.set_unavailable(true);
        let error = store.get_user_profile("u1").await.unwrap_err();
        assert_eq!(
            error.to_string(),
            "Data store `get_user_profile` failed: store unavailable"
        );
        assert!(store.list_global_documents().await.is_err());
    }
}
