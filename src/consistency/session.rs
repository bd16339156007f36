//! Per-participant refinement session state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::feedback::FeedbackHint;
use crate::pald::PaldDocument;
use crate::pseudonym::Pseudonym;

/// Pipeline state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Extracting,
    Generating,
    Describing,
    Scoring,
    Regenerating,
    Accepted,
    Terminal,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        self == SessionStatus::Terminal
    }

    /// A step of the pipeline is running.
    pub fn is_working(self) -> bool {
        matches!(
            self,
            SessionStatus::Extracting
                | SessionStatus::Generating
                | SessionStatus::Describing
                | SessionStatus::Scoring
                | SessionStatus::Regenerating
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Idle => "IDLE",
            SessionStatus::Extracting => "EXTRACTING",
            SessionStatus::Generating => "GENERATING",
            SessionStatus::Describing => "DESCRIBING",
            SessionStatus::Scoring => "SCORING",
            SessionStatus::Regenerating => "REGENERATING",
            SessionStatus::Accepted => "ACCEPTED",
            SessionStatus::Terminal => "TERMINAL",
        };
        f.write_str(name)
    }
}

/// Why an image was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptReason {
    /// Score reached the configured threshold.
    ThresholdMet,
    /// The iteration ceiling was reached.
    IterationCap,
    /// The scorer explicitly recommended acceptance.
    ScorerRecommendation,
    /// Description or re-extraction failed; the image is accepted as is.
    DescriptionUnavailable,
    /// A step failed unexpectedly after an image already existed.
    PartialResult,
    /// The participant accepted the current image.
    UserAccepted,
}

/// How the last turn ended, for presentation to the participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TurnOutcome {
    /// Extraction found no attributes; nothing was generated.
    NoAttributes,
    /// Auto-generation is switched off.
    GenerationDisabled,
    /// Image generation failed; see the session's `last_error`.
    GenerationFailed,
    Accepted { reason: AcceptReason },
    /// The participant stopped the session.
    Stopped,
}

/// One participant's refinement context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencySession {
    pub session_id: Uuid,
    pub pseudonym: Pseudonym,
    pub status: SessionStatus,
    /// Text the current input document was extracted from.
    pub input_text: Option<String>,
    pub input_pald: PaldDocument,
    pub image_ref: Option<String>,
    pub description_pald: Option<PaldDocument>,
    pub consistency_score: Option<f64>,
    /// Keys that differed in the last scoring pass.
    pub diff_keys: Vec<String>,
    /// Generate/score cycles in the current turn.
    pub iteration: u32,
    /// Feedback rounds consumed so far.
    pub feedback_round: u32,
    pub feedback_hint: Option<FeedbackHint>,
    pub outcome: Option<TurnOutcome>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConsistencySession {
    pub fn new(pseudonym: Pseudonym) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            pseudonym,
            status: SessionStatus::Idle,
            input_text: None,
            input_pald: PaldDocument::empty(),
            image_ref: None,
            description_pald: None,
            consistency_score: None,
            diff_keys: Vec::new(),
            iteration: 0,
            feedback_round: 0,
            feedback_hint: None,
            outcome: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, stamping `updated_at`.
    pub fn transition(&mut self, next: SessionStatus) {
        if self.status != next {
            log::debug!(
                "Session {} {} -> {}",
                self.session_id,
                self.status,
                next
            );
        }
        self.status = next;
        self.updated_at = Utc::now();
    }

    pub fn accept(&mut self, reason: AcceptReason) {
        self.outcome = Some(TurnOutcome::Accepted { reason });
        self.transition(SessionStatus::Accepted);
    }

    pub fn accept_reason(&self) -> Option<AcceptReason> {
        match self.outcome {
            Some(TurnOutcome::Accepted { reason }) => Some(reason),
            _ => None,
        }
    }
}
