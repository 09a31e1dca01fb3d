//! Outbound campaign dialer
//!
//! Control-plane loop separate from the media-plane engine. Each tick it
//! recycles expired leases, then for every running campaign inside its
//! dialing window leases leads (the store re-checks the concurrency cap
//! transactionally), paces originations by `min_interval_ms`, and dials
//! through the PBX.
//!
//! Answered channels take a dialplan hop that runs the PBX's AMD and then
//! re-enter the engine's Stasis app with
//! `(outbound_amd, attempt_id, status, cause, consent_digit?, consent_reason?)`
//! arguments. The engine parses those with [`AmdEntry`] and asks
//! [`Dialer::decide_amd`] which branch to take; the transient
//! exit-and-reenter is non-terminal.
//!
//! No predictive dialing: concurrency is capped, pacing is a simple
//! minimum interval, and there is no abandonment control.

pub mod amd;
pub mod worker;

pub use amd::{AmdDecision, AmdEntry};
pub use worker::Dialer;

use phone_agent_persistence::PersistenceError;
use phone_agent_transport::TransportError;

/// Dialer errors
#[derive(Debug, thiserror::Error)]
pub enum DialerError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid stasis arguments: {0}")]
    InvalidArgs(String),
}

/// Map a Q.850 hangup cause to an attempt outcome label.
pub fn outcome_for_hangup_cause(cause: i64) -> &'static str {
    match cause {
        17 => "busy",
        18 | 19 => "no_answer",
        21 => "rejected",
        34 | 38 | 42 => "congestion",
        _ => "failed",
    }
}

/// Whether an originate failure is worth requeueing the lead for.
/// 5xx and transport-level failures are transient; 4xx means the request
/// itself is wrong and retrying the same lead would loop forever.
pub fn originate_failure_is_retryable(error: &TransportError) -> bool {
    match error {
        // status 0 means the request never got a response: transient.
        TransportError::Http { status, .. } => status / 100 != 4,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hangup_causes_map_to_outcomes() {
        assert_eq!(outcome_for_hangup_cause(17), "busy");
        assert_eq!(outcome_for_hangup_cause(19), "no_answer");
        assert_eq!(outcome_for_hangup_cause(34), "congestion");
        assert_eq!(outcome_for_hangup_cause(16), "failed");
    }

    #[test]
    fn client_errors_are_not_retryable() {
        let permanent = TransportError::Http {
            status: 404,
            message: "originate: endpoint not found".into(),
        };
        assert!(!originate_failure_is_retryable(&permanent));
        assert!(originate_failure_is_retryable(&TransportError::Http {
            status: 503,
            message: "originate: allocation failed".into(),
        }));
        // Body text never influences the classification, only the code.
        assert!(originate_failure_is_retryable(&TransportError::Http {
            status: 503,
            message: "originate: retry after 4 seconds".into(),
        }));
        // No response at all (connect refused): transient.
        assert!(originate_failure_is_retryable(&TransportError::Http {
            status: 0,
            message: "connection refused".into(),
        }));
    }
}
