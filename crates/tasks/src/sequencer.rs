//! Human-facing ticket numbers.

use std::sync::Arc;

use taskmind_config::SequencerConfig;
use taskmind_core::error::StoreError;
use taskmind_core::task::TaskStore;
use tracing::{debug, warn};

use crate::retry::{RetryError, RetryPolicy};

/// Issues zero-padded, strictly increasing ticket ids from the store's counter.
pub struct TicketSequencer {
    store: Arc<dyn TaskStore>,
    width: usize,
    retry: RetryPolicy,
}

impl TicketSequencer {
    pub fn new(store: Arc<dyn TaskStore>, config: &SequencerConfig) -> Self {
        Self {
            store,
            width: config.width,
            retry: RetryPolicy::from_config(&config.retry),
        }
    }

    /// Draw the next ticket id.
    ///
    /// Contention and an unreachable store are retried with backoff; once the
    /// attempts are used up the caller sees [`StoreError::Conflict`].
    pub async fn next_ticket_id(&self) -> Result<String, StoreError> {
        let sequence = self
            .retry
            .run(
                || self.store.get_next_sequence(),
                |e| matches!(e, StoreError::Conflict(_) | StoreError::Unavailable(_)),
            )
            .await
            .map_err(|e| match e {
                RetryError::Fatal(e) => e,
                RetryError::Exhausted { attempts, last } => {
                    warn!(attempts, error = %last, "Ticket counter still contended");
                    StoreError::Conflict(format!(
                        "ticket counter unavailable after {attempts} attempts: {last}"
                    ))
                }
            })?;
        let ticket = format_ticket(sequence, self.width);
        debug!(ticket = %ticket, "Ticket issued");
        Ok(ticket)
    }
}

/// `43` with width 6 → `"000043"`. Wider numbers are never truncated.
pub fn format_ticket(sequence: u64, width: usize) -> String {
    format!("{sequence:0width$}")
}
