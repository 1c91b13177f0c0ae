//! # MCS Client
//!
//! One authenticated, framed, bidirectional stream to the push server.
//!
//! ## Run States
//! ```text
//! ┌─────────┐   ┌───────────────┐   ┌───────────┐   ┌─────────┐
//! │ Created │──►│ ConnectingTcp │──►│ LoggingIn │──►│ Started │
//! └─────────┘   └───────┬───────┘   └─────┬─────┘   └────┬────┘
//!                       │ retries         │ rejected,    │ idle timeout, read error,
//!                       │ exhausted       │ timed out    │ Close, error threshold
//!                       ▼                 ▼              ▼
//!                 ┌────────────────────────────────────────────┐
//!                 │         Stopping ──► Stopped               │
//!                 └────────────────────────────────────────────┘
//! ```
//!
//! A connection never restarts itself. Once `Stopped` it is discarded and the
//! tenant supervisor builds a new one.

pub mod connection;
pub mod transport;

pub use connection::McsConnection;
pub use transport::{BoxedStream, Dialer, FrameReader, FrameWriter, McsStream, TlsDialer};

// =============================================================================
// Run State
// =============================================================================

/// Lifecycle of one [`McsConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Created,
    ConnectingTcp,
    LoggingIn,
    Started,
    Stopping,
    Stopped,
}

impl RunState {
    /// Returns true until the connection begins shutting down.
    pub fn is_live(&self) -> bool {
        !matches!(self, RunState::Stopping | RunState::Stopped)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Created => write!(f, "created"),
            RunState::ConnectingTcp => write!(f, "connecting"),
            RunState::LoggingIn => write!(f, "logging_in"),
            RunState::Started => write!(f, "started"),
            RunState::Stopping => write!(f, "stopping"),
            RunState::Stopped => write!(f, "stopped"),
        }
    }
}

// =============================================================================
// Sequential Error Counters
// =============================================================================

/// Failure categories counted per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Connection,
    Read,
    Login,
    Notify,
}

impl ErrorCategory {
    const ALL: [ErrorCategory; 4] = [
        ErrorCategory::Connection,
        ErrorCategory::Read,
        ErrorCategory::Login,
        ErrorCategory::Notify,
    ];

    fn index(self) -> usize {
        match self {
            ErrorCategory::Connection => 0,
            ErrorCategory::Read => 1,
            ErrorCategory::Login => 2,
            ErrorCategory::Notify => 3,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Connection => write!(f, "connection"),
            ErrorCategory::Read => write!(f, "read"),
            ErrorCategory::Login => write!(f, "login"),
            ErrorCategory::Notify => write!(f, "notify"),
        }
    }
}

/// Consecutive failure counts per [`ErrorCategory`].
///
/// A success resets only its own category. A threshold of 0 never trips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequentialErrorCounters {
    threshold: u32,
    counts: [u32; 4],
}

impl SequentialErrorCounters {
    pub fn new(threshold: u32) -> Self {
        SequentialErrorCounters {
            threshold,
            counts: [0; 4],
        }
    }

    /// Records a failure. Returns true once the category reaches the threshold.
    pub fn record_failure(&mut self, category: ErrorCategory) -> bool {
        let count = &mut self.counts[category.index()];
        *count = count.saturating_add(1);
        self.threshold > 0 && *count >= self.threshold
    }

    pub fn record_success(&mut self, category: ErrorCategory) {
        self.counts[category.index()] = 0;
    }

    pub fn reset_all(&mut self) {
        self.counts = [0; 4];
    }

    pub fn count(&self, category: ErrorCategory) -> u32 {
        self.counts[category.index()]
    }

    /// Category at or above the threshold, if any.
    pub fn exceeded(&self) -> Option<ErrorCategory> {
        if self.threshold == 0 {
            return None;
        }
        ErrorCategory::ALL
            .into_iter()
            .find(|category| self.counts[category.index()] >= self.threshold)
    }
}

// =============================================================================
// Persistent Id Set
// =============================================================================

/// Persistent ids received since the last successful login, in receipt order.
///
/// Shared by the consecutive connections of one tenant so the next login can
/// replay them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistentIdSet {
    ids: Vec<String>,
}

impl PersistentIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an id. Returns false if it was already present.
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if self.contains(&id) {
            return false;
        }
        self.ids.push(id);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|existing| existing == id)
    }

    /// Ids in receipt order.
    pub fn snapshot(&self) -> Vec<String> {
        self.ids.clone()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_trips_exactly_at_threshold() {
        let mut counters = SequentialErrorCounters::new(3);
        assert!(!counters.record_failure(ErrorCategory::Read));
        assert!(!counters.record_failure(ErrorCategory::Read));
        assert!(counters.record_failure(ErrorCategory::Read));
        assert_eq!(counters.exceeded(), Some(ErrorCategory::Read));
    }

    #[test]
    fn test_success_resets_only_its_category() {
        let mut counters = SequentialErrorCounters::new(3);
        counters.record_failure(ErrorCategory::Notify);
        counters.record_failure(ErrorCategory::Notify);
        counters.record_failure(ErrorCategory::Login);

        counters.record_success(ErrorCategory::Notify);
        assert_eq!(counters.count(ErrorCategory::Notify), 0);
        assert_eq!(counters.count(ErrorCategory::Login), 1);

        assert!(!counters.record_failure(ErrorCategory::Notify));
        assert!(!counters.record_failure(ErrorCategory::Notify));
        assert!(counters.record_failure(ErrorCategory::Notify));
    }

    #[test]
    fn test_interleaved_categories_do_not_accumulate() {
        let mut counters = SequentialErrorCounters::new(2);
        assert!(!counters.record_failure(ErrorCategory::Read));
        assert!(!counters.record_failure(ErrorCategory::Notify));
        assert!(!counters.record_failure(ErrorCategory::Connection));
        assert_eq!(counters.exceeded(), None);
    }

    #[test]
    fn test_zero_threshold_never_trips() {
        let mut counters = SequentialErrorCounters::new(0);
        for _ in 0..10 {
            assert!(!counters.record_failure(ErrorCategory::Read));
        }
        assert_eq!(counters.exceeded(), None);
    }

    #[test]
    fn test_persistent_ids_keep_receipt_order() {
        let mut ids = PersistentIdSet::new();
        assert!(ids.insert("0:3"));
        assert!(ids.insert("0:1"));
        assert!(ids.insert("0:2"));
        assert!(!ids.insert("0:1"));

        assert_eq!(ids.snapshot(), vec!["0:3", "0:1", "0:2"]);
        ids.clear();
        assert!(ids.is_empty());
    }

    #[test]
    fn test_run_state_liveness() {
        assert!(RunState::Created.is_live());
        assert!(RunState::Started.is_live());
        assert!(!RunState::Stopping.is_live());
        assert!(!RunState::Stopped.is_live());
    }
}
