use std::sync::Arc;
use tracing::{debug, warn};

use crate::usage_limit::store::UsageStore;
use crate::usage_limit::QuotaCheck;

/// Reads persistent usage and compares it against ceilings.
///
/// The governor never resets counts; calendar boundaries belong to the store.
#[derive(Clone)]
pub struct QuotaGovernor {
    store: Arc<dyn UsageStore>,
}

impl std::fmt::Debug for QuotaGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaGovernor").finish_non_exhaustive()
    }
}

impl QuotaGovernor {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self { store }
    }

    /// Checks `user_id` against the daily and optional monthly ceiling for `feature`.
    ///
    /// If the store cannot be reached the check fails open. The store error is
    /// logged once when it is constructed.
    pub async fn check_user_quota(
        &self,
        user_id: &str,
        feature: &str,
        daily_limit: u64,
        monthly_limit: Option<u64>,
    ) -> QuotaCheck {
        let usage = match self.store.get_usage(user_id, feature).await {
            Ok(usage) => usage,
            Err(_) => {
                debug!(user_id, feature, "Usage store unreachable, allowing request");
                return QuotaCheck {
                    allowed: true,
                    daily_usage: 0,
                    monthly_usage: monthly_limit.map(|_| 0),
                };
            }
        };

        let within_daily = usage.daily < daily_limit;
        let within_monthly = monthly_limit.is_none_or(|limit| usage.monthly < limit);
        QuotaCheck {
            allowed: within_daily && within_monthly,
            daily_usage: usage.daily,
            monthly_usage: monthly_limit.map(|_| usage.monthly),
        }
    }

    /// Counts one use of `feature`. Failures are logged and otherwise ignored.
    pub async fn record_usage(&self, user_id: &str, feature: &str) {
        if let Err(e) = self.store.increment_usage(user_id, feature).await {
            warn!(user_id, feature, "Failed to record usage: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FailingUsageStore;
    use crate::usage_limit::store::InMemoryUsageStore;
    use tracing_test::traced_test;

    async fn governor_with_usage(uses: usize) -> QuotaGovernor {
        let store = InMemoryUsageStore::new();
        for _ in 0..uses {
            store.increment_usage("u1", "ai_chat").await.unwrap();
        }
        QuotaGovernor::new(Arc::new(store))
    }

    #[tokio::test]
    async fn test_under_daily_limit_is_allowed() {
        let governor = governor_with_usage(2).await;
        let check = governor.check_user_quota("u1", "ai_chat", 3, None).await;
        assert!(check.allowed);
        assert_eq!(check.daily_usage, 2);
        assert_eq!(check.monthly_usage, None);
    }

    #[tokio::test]
    async fn test_at_daily_limit_is_denied() {
        let governor = governor_with_usage(3).await;
        let check = governor.check_user_quota("u1", "ai_chat", 3, Some(100)).await;
        assert!(!check.allowed);
        assert_eq!(check.daily_usage, 3);
        assert_eq!(check.monthly_usage, Some(3));
    }

    #[tokio::test]
    async fn test_monthly_limit_applies() {
        let governor = governor_with_usage(5).await;
        let check = governor.check_user_quota("u1", "ai_chat", 100, Some(5)).await;
        assert!(!check.allowed);
    }

    #[tokio::test]
    async fn test_record_usage_increments() {
        let governor = governor_with_usage(0).await;
        governor.record_usage("u1", "ai_chat").await;
        let check = governor.check_user_quota("u1", "ai_chat", 10, None).await;
        assert_eq!(check.daily_usage, 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_store_failure_fails_open_with_one_error_logged() {
        let governor = QuotaGovernor::new(Arc::new(FailingUsageStore));
        let check = governor.check_user_quota("u1", "ai_chat", 1, Some(1)).await;
        assert!(check.allowed);
        assert_eq!(check.daily_usage, 0);

        logs_assert(|lines: &[&str]| {
            let errors = lines.iter().filter(|line| line.contains("ERROR")).count();
            match errors {
                1 => Ok(()),
                n => Err(format!("expected exactly one error log, found {n}")),
            }
        });
    }
}
