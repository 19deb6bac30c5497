//! Lifecycle of a stateful provider run.
//!
//! ```text
//! Created -> Queued -> InProgress -> { Completed | Failed | Timeout }
//! ```
//!
//! [`next_state`] is a pure function of the observed provider status and the
//! attempt count, so the polling bound can be tested without a provider.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunState {
    Created,
    Queued,
    InProgress,
    Completed,
    Failed,
    Timeout,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Timeout
        )
    }

    /// Maps a provider status string. Unknown statuses are treated as still running.
    pub fn from_provider_status(status: &str) -> RunState {
        match status {
            "queued" => RunState::Queued,
            "in_progress" | "cancelling" => RunState::InProgress,
            "completed" => RunState::Completed,
            "failed" | "cancelled" | "expired" | "incomplete" | "requires_action" => {
                RunState::Failed
            }
            other => {
                tracing::debug!(status = other, "Unrecognized run status, still polling");
                RunState::InProgress
            }
        }
    }
}

/// State after the `attempt`-th status check (1-based) observed `provider_status`.
///
/// Terminal states are sticky. A run still pending after `max_attempts` checks
/// times out.
pub fn next_state(
    current: RunState,
    provider_status: &str,
    attempt: u32,
    max_attempts: u32,
) -> RunState {
    if current.is_terminal() {
        return current;
    }
    match RunState::from_provider_status(provider_status) {
        state if state.is_terminal() => state,
        _ if attempt >= max_attempts => RunState::Timeout,
        state => state,
    }
}

/// One turn's handle on the provider. Never reused across turns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSession {
    pub thread_id: String,
    pub run_id: String,
    pub status: RunState,
}

impl ProviderSession {
    pub fn new(thread_id: String, run_id: String) -> Self {
        Self {
            thread_id,
            run_id,
            status: RunState::Created,
        }
    }

    pub fn observe(&mut self, provider_status: &str, attempt: u32, max_attempts: u32) -> RunState {
        self.status = next_state(self.status, provider_status, attempt, max_attempts);
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_status_mapping() {
        assert_eq!(RunState::from_provider_status("queued"), RunState::Queued);
        assert_eq!(RunState::from_provider_status("in_progress"), RunState::InProgress);
        assert_eq!(RunState::from_provider_status("cancelling"), RunState::InProgress);
        assert_eq!(RunState::from_provider_status("completed"), RunState::Completed);
        for failed in ["failed", "cancelled", "expired", "incomplete", "requires_action"] {
            assert_eq!(RunState::from_provider_status(failed), RunState::Failed);
        }
        assert_eq!(RunState::from_provider_status("something_new"), RunState::InProgress);
    }

    #[test]
    fn test_pending_run_times_out_on_last_attempt() {
        assert_eq!(next_state(RunState::Created, "queued", 1, 30), RunState::Queued);
        assert_eq!(next_state(RunState::Queued, "in_progress", 29, 30), RunState::InProgress);
        assert_eq!(next_state(RunState::InProgress, "in_progress", 30, 30), RunState::Timeout);
        assert_eq!(next_state(RunState::InProgress, "queued", 30, 30), RunState::Timeout);
    }

    #[test]
    fn test_completion_on_last_attempt_is_not_a_timeout() {
        assert_eq!(next_state(RunState::InProgress, "completed", 30, 30), RunState::Completed);
        assert_eq!(next_state(RunState::InProgress, "failed", 30, 30), RunState::Failed);
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        assert_eq!(next_state(RunState::Failed, "completed", 2, 30), RunState::Failed);
        assert_eq!(next_state(RunState::Timeout, "completed", 31, 30), RunState::Timeout);
        assert_eq!(next_state(RunState::Completed, "failed", 3, 30), RunState::Completed);
    }

    #[test]
    fn test_session_tracks_state() {
        let mut session = ProviderSession::new("thread_1".to_string(), "run_1".to_string());
        assert_eq!(session.status, RunState::Created);
        assert_eq!(session.observe("queued", 1, 3), RunState::Queued);
        assert_eq!(session.observe("in_progress", 2, 3), RunState::InProgress);
        assert_eq!(session.observe("in_progress", 3, 3), RunState::Timeout);
        assert_eq!(session.status.to_string(), "timeout");
    }
}
