//! Job lifecycle states, events, and the transition function.
//!
//! ```text
//! (none) ──Uploaded──────────────▶ uploaded
//! uploaded ──Enqueued────────────▶ processing
//! uploaded ──DigitalDetected─────▶ free-ready
//! uploaded ──EnqueueFailed───────▶ error
//! processing ──PollProgress──────▶ processing
//! processing ──PollReady(content)▶ ready
//! processing ──PollFailed────────▶ error
//! processing ──PollBudgetExhausted▶ error
//! ready | paid ──PaymentConfirmed▶ paid
//! paid ──ExportRequested─────────▶ exporting
//! exporting ──ExportSucceeded────▶ paid
//! exporting ──ExportFailed───────▶ error
//! exporting ──ExportAbandoned────▶ paid
//! exporting ──PaymentRejected────▶ ready
//! error ──RetryExport────────────▶ paid
//! any ──Reset────────────────────▶ (none)
//! ```
//!
//! [`transition`] is the only place these rules live. Side-channel actions
//! (watermarked preview download, free digital export) are not events.

use crate::error::TransitionError;
use serde::{Deserialize, Serialize};

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Uploaded,
    /// Enqueued for OCR. The backend reports this as `queued` or `processing`.
    #[serde(alias = "queued")]
    Processing,
    Ready,
    /// A digital PDF that skipped OCR; exportable without payment.
    FreeReady,
    Paid,
    Exporting,
    Error,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Uploaded => "uploaded",
            JobState::Processing => "processing",
            JobState::Ready => "ready",
            JobState::FreeReady => "free-ready",
            JobState::Paid => "paid",
            JobState::Exporting => "exporting",
            JobState::Error => "error",
        }
    }

    /// States from which a poll result can no longer change anything.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            JobState::Ready | JobState::FreeReady | JobState::Paid | JobState::Exporting
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Uploaded,
    DigitalDetected,
    Enqueued,
    EnqueueFailed,
    PollProgress,
    /// Backend reported ready; `has_content` is false when it omitted the document.
    PollReady { has_content: bool },
    PollFailed,
    PollBudgetExhausted,
    PaymentConfirmed,
    ExportRequested,
    ExportSucceeded,
    ExportFailed,
    /// The export was dropped before its result arrived.
    ExportAbandoned,
    /// The backend refused the export because it has no record of the payment.
    PaymentRejected,
    RetryExport,
    Reset,
}

/// Apply `event` to `from`, returning the next state or rejecting the event.
///
/// `None` is "no job". A ready report without content leaves the job processing.
pub fn transition(
    from: Option<JobState>,
    event: &JobEvent,
) -> Result<Option<JobState>, TransitionError> {
    use JobEvent as E;
    use JobState as S;

    let next = match (from, event) {
        (_, E::Reset) => None,
        (None, E::Uploaded) => Some(S::Uploaded),
        (Some(S::Uploaded), E::DigitalDetected) => Some(S::FreeReady),
        (Some(S::Uploaded), E::Enqueued) => Some(S::Processing),
        (Some(S::Uploaded), E::EnqueueFailed) => Some(S::Error),
        (Some(S::Processing), E::PollProgress) => Some(S::Processing),
        (Some(S::Processing), E::PollReady { has_content: true }) => Some(S::Ready),
        (Some(S::Processing), E::PollReady { has_content: false }) => Some(S::Processing),
        (Some(S::Processing), E::PollFailed | E::PollBudgetExhausted) => Some(S::Error),
        (Some(S::Ready | S::Paid), E::PaymentConfirmed) => Some(S::Paid),
        (Some(S::Paid), E::ExportRequested) => Some(S::Exporting),
        (Some(S::Exporting), E::ExportSucceeded | E::ExportAbandoned) => Some(S::Paid),
        (Some(S::Exporting), E::PaymentRejected) => Some(S::Ready),
        (Some(S::Exporting), E::ExportFailed) => Some(S::Error),
        (Some(S::Error), E::RetryExport) => Some(S::Paid),
        _ => {
            return Err(TransitionError {
                from,
                event: *event,
            })
        }
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobEvent as E;
    use JobState as S;

    const ALL_STATES: [Option<JobState>; 8] = [
        None,
        Some(S::Uploaded),
        Some(S::Processing),
        Some(S::Ready),
        Some(S::FreeReady),
        Some(S::Paid),
        Some(S::Exporting),
        Some(S::Error),
    ];

    #[test]
    fn happy_path_scanned() {
        let mut state = None;
        for event in [
            E::Uploaded,
            E::Enqueued,
            E::PollProgress,
            E::PollReady { has_content: true },
            E::PaymentConfirmed,
            E::ExportRequested,
            E::ExportSucceeded,
        ] {
            state = transition(state, &event).unwrap();
        }
        assert_eq!(state, Some(S::Paid));
    }

    #[test]
    fn ready_without_content_is_not_ready() {
        assert_eq!(
            transition(Some(S::Processing), &E::PollReady { has_content: false }),
            Ok(Some(S::Processing))
        );
    }

    #[test]
    fn payment_confirmation_is_idempotent() {
        assert_eq!(transition(Some(S::Paid), &E::PaymentConfirmed), Ok(Some(S::Paid)));
    }

    #[test]
    fn exporting_always_has_a_way_out() {
        assert_eq!(transition(Some(S::Exporting), &E::ExportAbandoned), Ok(Some(S::Paid)));
        assert_eq!(transition(Some(S::Exporting), &E::PaymentRejected), Ok(Some(S::Ready)));
        assert!(transition(Some(S::Paid), &E::ExportAbandoned).is_err());
        assert!(transition(Some(S::Error), &E::PaymentRejected).is_err());
    }

    #[test]
    fn reset_is_legal_from_everywhere() {
        for state in ALL_STATES {
            assert_eq!(transition(state, &E::Reset), Ok(None));
        }
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        for (from, event) in [
            (None, E::Enqueued),
            (Some(S::Ready), E::ExportRequested),
            (Some(S::FreeReady), E::PaymentConfirmed),
            (Some(S::Paid), E::PollReady { has_content: true }),
            (Some(S::Processing), E::PaymentConfirmed),
            (Some(S::Uploaded), E::Uploaded),
            (Some(S::Error), E::Enqueued),
        ] {
            let err = transition(from, &event).unwrap_err();
            assert_eq!(err.from, from);
            assert_eq!(err.event, event);
        }
    }

    #[test]
    fn settled_states_never_reenter_processing() {
        for state in [S::Ready, S::FreeReady, S::Paid, S::Exporting] {
            assert!(state.is_settled());
            for event in [E::PollProgress, E::PollFailed, E::PollBudgetExhausted] {
                assert!(transition(Some(state), &event).is_err());
            }
        }
    }

    #[test]
    fn legacy_queued_state_loads_as_processing() {
        let s: JobState = serde_json::from_str("\"queued\"").unwrap();
        assert_eq!(s, S::Processing);
        assert_eq!(serde_json::to_string(&S::FreeReady).unwrap(), "\"free-ready\"");
    }
}
