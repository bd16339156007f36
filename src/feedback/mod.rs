//! Post-acceptance feedback rounds.
//!
//! Once an image is accepted the participant may send free-text feedback.
//! Each submission consumes one round and re-runs the consistency pipeline
//! with the feedback folded in as an advisory hint. Stopping or accepting
//! ends the session without consuming a round.

pub mod hint;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::FeedbackConfig;
use crate::consistency::{
    AcceptReason, CancelRequest, ConsistencyController, ConsistencySession, SessionStatus,
    TurnOutcome,
};
use crate::errors::PipelineError;

pub use hint::FeedbackHint;

/// Signal target used for image ratings.
pub const AVATAR_TARGET: &str = "avatar";

/// Answer to a feedback submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackResponse {
    /// Whether the participant may submit another round.
    #[serde(rename = "continue")]
    pub continue_loop: bool,
    pub max_reached: bool,
}

/// Feedback loop on top of a [`ConsistencyController`].
#[derive(Debug, Clone)]
pub struct FeedbackLoop {
    controller: Arc<ConsistencyController>,
    config: FeedbackConfig,
}

impl FeedbackLoop {
    pub fn new(controller: Arc<ConsistencyController>, config: FeedbackConfig) -> Self {
        Self { controller, config }
    }

    pub fn controller(&self) -> &Arc<ConsistencyController> {
        &self.controller
    }

    pub fn max_rounds(&self) -> u32 {
        self.config.max_feedback_rounds
    }

    /// Apply one round of feedback and regenerate.
    pub async fn submit_feedback(
        &self,
        session: &mut ConsistencySession,
        text: &str,
    ) -> Result<FeedbackResponse, PipelineError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PipelineError::EmptyFeedback);
        }
        let has_image = session.image_ref.is_some();
        let ready = match session.status {
            SessionStatus::Accepted => true,
            SessionStatus::Idle => has_image,
            _ => false,
        };
        if !ready {
            return Err(PipelineError::InvalidState {
                operation: "submit_feedback".to_string(),
                state: session.status.to_string(),
            });
        }

        let max_rounds = self.config.max_feedback_rounds;
        if session.feedback_round >= max_rounds {
            log::info!(
                "Session {} has used all {} feedback rounds",
                session.session_id,
                max_rounds
            );
            self.controller.terminate(session, None);
            return Ok(FeedbackResponse {
                continue_loop: false,
                max_reached: true,
            });
        }

        let previous_round = session.feedback_round;
        let previous_hint = session.feedback_hint.clone();
        session.feedback_round += 1;
        let schema = self.controller.schema().get();
        let parsed = FeedbackHint::parse(text, &schema.keys);
        log::debug!(
            "Session {} feedback round {}/{}: {} override(s)",
            session.session_id,
            session.feedback_round,
            max_rounds,
            parsed.overrides.len()
        );
        session.feedback_hint = Some(match &session.feedback_hint {
            Some(previous) => previous.merged_with(&parsed),
            None => parsed,
        });

        // A rejected run must leave the round and hint untouched.
        let status = match self.controller.run_consistency_pipeline(session).await {
            Ok(status) => status,
            Err(e) => {
                session.feedback_round = previous_round;
                session.feedback_hint = previous_hint;
                return Err(e);
            }
        };

        let max_reached = session.feedback_round >= max_rounds;
        if max_reached && !status.is_terminal() {
            self.controller.terminate(session, None);
        }
        Ok(FeedbackResponse {
            continue_loop: !max_reached && !session.status.is_terminal(),
            max_reached,
        })
    }

    /// End the session, keeping whatever was last accepted on record as
    /// stopped. Cancels a step running elsewhere for the same participant.
    pub fn stop_feedback_loop(&self, session: &mut ConsistencySession) {
        if session.status.is_terminal() {
            return;
        }
        self.controller
            .cancel(&session.pseudonym, CancelRequest::Stop);
        self.controller
            .terminate(session, Some(TurnOutcome::Stopped));
    }

    /// Accept the current image and end the session.
    pub fn accept_current(
        &self,
        session: &mut ConsistencySession,
    ) -> Result<(), PipelineError> {
        if session.status.is_terminal() {
            return Ok(());
        }
        if session.image_ref.is_none() {
            return Err(PipelineError::InvalidState {
                operation: "accept_current (no image)".to_string(),
                state: session.status.to_string(),
            });
        }
        self.controller
            .cancel(&session.pseudonym, CancelRequest::AcceptCurrent);
        self.controller.terminate(
            session,
            Some(TurnOutcome::Accepted {
                reason: AcceptReason::UserAccepted,
            }),
        );
        Ok(())
    }

    /// Record the participant's rating of the current image, `0..=5`.
    pub fn rate_image(&self, session: &ConsistencySession, rating: f64) -> bool {
        self.controller.signals().collect_feedback_signal(
            &session.pseudonym,
            AVATAR_TARGET,
            rating.clamp(0.0, 5.0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consistency::testing::{
        controller_with, ScriptedDescriber, ScriptedExtractor, ScriptedGenerator,
    };
    use crate::federated::{SignalCollector, SignalKind};
    use crate::pseudonym::Pseudonym;
    use serde_json::json;

    const INPUT: &str = "a woman with a ponytail";

    struct Fixture {
        feedback: FeedbackLoop,
        generator: Arc<ScriptedGenerator>,
        collector: SignalCollector,
    }

    fn fixture(max_rounds: u32) -> Fixture {
        let extractor = ScriptedExtractor::new()
            .respond(
                INPUT,
                json!({"global": {"gender": "female"}, "detail": {"hair": {"style": "ponytail"}}}),
            )
            .respond(
                "matching",
                json!({"global.gender": "female", "detail.hair.style": "ponytail"}),
            );
        let generator = Arc::new(ScriptedGenerator::new());
        let collector = SignalCollector::new();
        let controller = controller_with(
            Arc::new(extractor),
            generator.clone(),
            Arc::new(ScriptedDescriber::always("matching")),
            3,
        )
        .with_signal_sink(Arc::new(collector.clone()));
        Fixture {
            feedback: FeedbackLoop::new(
                Arc::new(controller),
                FeedbackConfig {
                    max_feedback_rounds: max_rounds,
                },
            ),
            generator,
            collector,
        }
    }

    async fn accepted_session(fx: &Fixture) -> ConsistencySession {
        let controller = fx.feedback.controller();
        let mut session = controller.open_session(Pseudonym::new("p-1")).unwrap();
        controller.process_turn(&mut session, INPUT).await.unwrap();
        assert_eq!(session.status, SessionStatus::Accepted);
        session
    }

    #[tokio::test]
    async fn test_rounds_capped() {
        let fx = fixture(2);
        let mut session = accepted_session(&fx).await;

        let first = fx.feedback.submit_feedback(&mut session, "more smile").await.unwrap();
        assert_eq!(
            first,
            FeedbackResponse {
                continue_loop: true,
                max_reached: false
            }
        );

        let second = fx.feedback.submit_feedback(&mut session, "less smile").await.unwrap();
        assert!(!second.continue_loop);
        assert!(second.max_reached);
        assert_eq!(session.status, SessionStatus::Terminal);
        assert_eq!(session.feedback_round, 2);

        let err = fx.feedback.submit_feedback(&mut session, "again").await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState { .. }));
        assert_eq!(session.feedback_round, 2);
    }

    #[tokio::test]
    async fn test_zero_rounds_terminates_immediately() {
        let fx = fixture(0);
        let mut session = accepted_session(&fx).await;
        let calls_before = fx.generator.calls();

        let response = fx.feedback.submit_feedback(&mut session, "anything").await.unwrap();
        assert!(!response.continue_loop);
        assert!(response.max_reached);
        assert_eq!(session.status, SessionStatus::Terminal);
        assert_eq!(session.feedback_round, 0);
        assert_eq!(fx.generator.calls(), calls_before);
    }

    #[tokio::test]
    async fn test_feedback_overrides_reach_generator() {
        let fx = fixture(3);
        let mut session = accepted_session(&fx).await;

        fx.feedback
            .submit_feedback(&mut session, "warmer light, detail.hair.color: red")
            .await
            .unwrap();

        let last = fx.generator.requests().pop().unwrap();
        assert_eq!(last.pald.get("detail.hair.color"), Some(&json!("red")));
        assert_eq!(last.pald.get("global.gender"), Some(&json!("female")));
        assert_eq!(last.hint.as_deref(), Some("warmer light"));
        assert!(!session.input_pald.contains_key("detail.hair.color"));
    }

    #[tokio::test]
    async fn test_busy_participant_keeps_round_and_hint() {
        let fx = fixture(3);
        let mut session = accepted_session(&fx).await;
        let calls_before = fx.generator.calls();

        let guard = fx.feedback.controller().registry().enter(&session).unwrap();
        let err = fx
            .feedback
            .submit_feedback(&mut session, "warmer, detail.hair.color: red")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ParticipantBusy { .. }));
        assert_eq!(session.feedback_round, 0);
        assert!(session.feedback_hint.is_none());
        assert_eq!(fx.generator.calls(), calls_before);
        drop(guard);

        let response = fx.feedback.submit_feedback(&mut session, "warmer").await.unwrap();
        assert!(response.continue_loop);
        assert_eq!(session.feedback_round, 1);
    }

    #[tokio::test]
    async fn test_empty_feedback_rejected() {
        let fx = fixture(3);
        let mut session = accepted_session(&fx).await;
        let err = fx.feedback.submit_feedback(&mut session, "   ").await.unwrap_err();
        assert!(matches!(err, PipelineError::EmptyFeedback));
        assert_eq!(session.feedback_round, 0);
    }

    #[tokio::test]
    async fn test_feedback_requires_accepted_image() {
        let fx = fixture(3);
        let mut session = fx
            .feedback
            .controller()
            .open_session(Pseudonym::new("p-1"))
            .unwrap();
        let err = fx.feedback.submit_feedback(&mut session, "hi").await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_stop_and_accept_do_not_consume_rounds() {
        let fx = fixture(3);
        let mut session = accepted_session(&fx).await;
        fx.feedback.accept_current(&mut session).unwrap();
        assert_eq!(session.status, SessionStatus::Terminal);
        assert_eq!(session.accept_reason(), Some(AcceptReason::UserAccepted));
        assert_eq!(session.feedback_round, 0);
        assert_eq!(fx.feedback.controller().registry().active_count(), 0);

        let mut other = accepted_session(&fx).await;
        fx.feedback.stop_feedback_loop(&mut other);
        assert_eq!(other.status, SessionStatus::Terminal);
        assert_eq!(other.outcome, Some(TurnOutcome::Stopped));
        assert_eq!(other.feedback_round, 0);
    }

    #[tokio::test]
    async fn test_rating_emits_feedback_signal() {
        let fx = fixture(3);
        let session = accepted_session(&fx).await;
        assert!(fx.feedback.rate_image(&session, 7.0));
        let ratings: Vec<_> = fx
            .collector
            .snapshot()
            .into_iter()
            .filter(|s| s.kind() == SignalKind::FeedbackClick)
            .collect();
        assert_eq!(ratings.len(), 1);
        assert_eq!(ratings[0].measure(), 5.0);
        assert_eq!(ratings[0].group_key(), "feedback_avatar");
    }
}
