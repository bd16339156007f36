//! Drives one participant's session through extraction, generation,
//! description and scoring until an image is accepted.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::registry::{CancelRequest, SessionRegistry, SessionSlot};
use super::session::{AcceptReason, ConsistencySession, SessionStatus, TurnOutcome};
use crate::config::PipelineConfig;
use crate::errors::PipelineError;
use crate::federated::{DisabledSignalSink, SignalSink};
use crate::pald::cache::LoadedSchema;
use crate::pald::{flatten, ConsistencyScorer, KeyOverlapScorer, PaldDocument, SchemaProvider};
use crate::persistence::SessionStore;
use crate::pseudonym::Pseudonym;
use crate::services::{GenerationRequest, ImageDescriber, ImageGenerator, PaldExtractor};

/// Result of feeding one piece of free text into a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResult {
    pub pald_extracted: bool,
    pub pald: PaldDocument,
    pub status: SessionStatus,
}

/// The consistency pipeline.
///
/// Holds the collaborators and shared state; sessions themselves are owned
/// by the caller and passed in by `&mut`. The registry makes sure only one
/// step per participant runs at a time even when callers hold copies.
pub struct ConsistencyController {
    config: PipelineConfig,
    schema: SchemaProvider,
    extractor: Arc<dyn PaldExtractor>,
    generator: Arc<dyn ImageGenerator>,
    describer: Arc<dyn ImageDescriber>,
    scorer: Arc<dyn ConsistencyScorer>,
    registry: Arc<SessionRegistry>,
    signals: Arc<dyn SignalSink>,
    store: Option<Arc<dyn SessionStore>>,
}

impl std::fmt::Debug for ConsistencyController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistencyController")
            .field("config", &self.config)
            .field("schema", &self.schema)
            .field("scorer", &self.scorer)
            .field("active_sessions", &self.registry.active_count())
            .field("signals_enabled", &self.signals.is_enabled())
            .field("store", &self.store)
            .finish()
    }
}

impl ConsistencyController {
    pub fn new(
        config: PipelineConfig,
        schema: SchemaProvider,
        extractor: Arc<dyn PaldExtractor>,
        generator: Arc<dyn ImageGenerator>,
        describer: Arc<dyn ImageDescriber>,
    ) -> Self {
        Self {
            config,
            schema,
            extractor,
            generator,
            describer,
            scorer: Arc::new(KeyOverlapScorer::default()),
            registry: Arc::new(SessionRegistry::new()),
            signals: Arc::new(DisabledSignalSink),
            store: None,
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn ConsistencyScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_signal_sink(mut self, signals: Arc<dyn SignalSink>) -> Self {
        self.signals = signals;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share a registry with other controllers in the same process.
    pub fn with_registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn schema(&self) -> &SchemaProvider {
        &self.schema
    }

    pub(crate) fn signals(&self) -> &Arc<dyn SignalSink> {
        &self.signals
    }

    /// Start a session for `pseudonym`.
    pub fn open_session(&self, pseudonym: Pseudonym) -> Result<ConsistencySession, PipelineError> {
        let session = ConsistencySession::new(pseudonym);
        self.registry.open(&session.pseudonym, session.session_id)?;
        log::info!(
            "Opened session {} for {}",
            session.session_id,
            session.pseudonym
        );
        Ok(session)
    }

    /// Park a stop/accept request for the participant's session.
    ///
    /// The request stays parked until the pipeline next checks it, so one
    /// made while no step is running ends the session at the start of the
    /// next generation. Callers holding an idle session should use
    /// [`crate::feedback::FeedbackLoop::stop_feedback_loop`] instead.
    pub fn cancel(&self, pseudonym: &Pseudonym, request: CancelRequest) -> bool {
        self.registry.cancel(pseudonym, request)
    }

    /// Extract attributes from `text` and, if any were found, run the
    /// generate/describe/score loop.
    pub async fn process_turn(
        &self,
        session: &mut ConsistencySession,
        text: &str,
    ) -> Result<TurnResult, PipelineError> {
        ensure_not_terminal(session, "process_turn")?;
        let guard = self.registry.enter(session)?;
        let schema = self.schema.get();

        session.transition(SessionStatus::Extracting);
        session.last_error = None;
        let raw = match self.extractor.extract_pald(text).await {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!(
                    "Extraction failed for session {}: {}",
                    session.session_id,
                    e
                );
                session.last_error = Some(format!("extraction failed: {}", e));
                Value::Null
            }
        };
        let pald = schema.validate(&flatten(&raw));
        log::debug!(
            "Session {} extracted {} attribute(s)",
            session.session_id,
            pald.len()
        );

        session.input_text = Some(text.to_string());
        session.input_pald = pald.clone();
        session.description_pald = None;
        session.consistency_score = None;
        session.diff_keys.clear();
        session.feedback_round = 0;
        session.feedback_hint = None;

        for (key, value) in pald.iter() {
            self.signals
                .collect_pald_signal(&session.pseudonym, key, &value_text(value), 1.0);
        }

        self.drive(session, guard.slot(), &schema).await;

        Ok(TurnResult {
            pald_extracted: !pald.is_empty(),
            pald,
            status: session.status,
        })
    }

    /// Re-run generation for the session's current input, applying any
    /// feedback hint it carries.
    pub async fn run_consistency_pipeline(
        &self,
        session: &mut ConsistencySession,
    ) -> Result<SessionStatus, PipelineError> {
        ensure_not_terminal(session, "run_consistency_pipeline")?;
        let guard = self.registry.enter(session)?;
        let schema = self.schema.get();
        self.drive(session, guard.slot(), &schema).await;
        Ok(session.status)
    }

    /// End the session for good and release the participant.
    ///
    /// `outcome` replaces the recorded outcome when given.
    pub(crate) fn terminate(&self, session: &mut ConsistencySession, outcome: Option<TurnOutcome>) {
        if let Some(outcome) = outcome {
            session.outcome = Some(outcome);
        }
        session.transition(SessionStatus::Terminal);
        self.registry.close(&session.pseudonym, session.session_id);
        log::info!("Session {} terminated", session.session_id);
        self.save_snapshot(session);
    }

    async fn drive(
        &self,
        session: &mut ConsistencySession,
        slot: &SessionSlot,
        schema: &LoadedSchema,
    ) {
        session.iteration = 0;
        session.outcome = None;

        if session.input_pald.is_empty() {
            session.outcome = Some(TurnOutcome::NoAttributes);
            session.transition(SessionStatus::Idle);
            self.save_snapshot(session);
            return;
        }
        if !self.config.auto_generate_images {
            session.outcome = Some(TurnOutcome::GenerationDisabled);
            session.transition(SessionStatus::Idle);
            self.save_snapshot(session);
            return;
        }

        // Always regenerate from the input document, never the described one.
        let (request_pald, hint) = match &session.feedback_hint {
            Some(h) => (session.input_pald.with_overrides(&h.overrides), h.advisory()),
            None => (session.input_pald.clone(), None),
        };
        let max_iterations = self.config.max_iterations();
        let mut produced_image = false;

        loop {
            if self.apply_cancel(session, slot) {
                break;
            }
            session.iteration += 1;
            session.transition(SessionStatus::Generating);
            let request = GenerationRequest {
                pald: request_pald.clone(),
                hint: hint.clone(),
                iteration: session.iteration,
            };
            let generated = self.generator.generate_image(&request).await;
            if self.apply_cancel(session, slot) {
                break;
            }
            match generated {
                Ok(result) if result.success && result.image_ref.is_some() => {
                    session.image_ref = result.image_ref;
                    produced_image = true;
                }
                Ok(result) => {
                    let error = result
                        .error
                        .unwrap_or_else(|| "generator returned no image".to_string());
                    self.fail_generation(session, error);
                    break;
                }
                Err(e) if produced_image => {
                    log::warn!(
                        "Generation error after an image existed in session {}: {}",
                        session.session_id,
                        e
                    );
                    session.last_error = Some(e.to_string());
                    session.accept(AcceptReason::PartialResult);
                    break;
                }
                Err(e) => {
                    self.fail_generation(session, e.to_string());
                    break;
                }
            }

            session.transition(SessionStatus::Describing);
            let image_ref = session.image_ref.clone().unwrap_or_default();
            let described = self.describe(&image_ref, schema).await;
            if self.apply_cancel(session, slot) {
                break;
            }
            let described = match described {
                Ok(described) => described,
                Err(e) => {
                    log::warn!(
                        "Description failed for session {}, accepting image: {}",
                        session.session_id,
                        e
                    );
                    session.last_error = Some(format!("description failed: {}", e));
                    session.accept(AcceptReason::DescriptionUnavailable);
                    break;
                }
            };

            session.transition(SessionStatus::Scoring);
            let report = self.scorer.score(&request_pald, &described);
            let score = if report.score.is_finite() {
                report.score.clamp(0.0, 1.0)
            } else {
                0.0
            };
            log::debug!(
                "Session {} iteration {}/{} scored {:.3}",
                session.session_id,
                session.iteration,
                max_iterations,
                score
            );
            for key in request_pald.keys() {
                let label = if report.matched_keys.contains(key) {
                    1.0
                } else {
                    0.0
                };
                self.signals
                    .collect_consistency_signal(&session.pseudonym, key, label);
            }
            session.description_pald = Some(described);
            session.consistency_score = Some(score);
            session.diff_keys = report.diff_keys.clone();

            if score >= self.config.consistency_threshold {
                session.accept(AcceptReason::ThresholdMet);
                break;
            }
            if report.recommends_accept() {
                session.accept(AcceptReason::ScorerRecommendation);
                break;
            }
            if session.iteration >= max_iterations {
                session.accept(AcceptReason::IterationCap);
                break;
            }
            session.transition(SessionStatus::Regenerating);
        }

        if session.status == SessionStatus::Accepted {
            log::info!(
                "Session {} accepted after {} iteration(s): {:?}",
                session.session_id,
                session.iteration,
                session.accept_reason()
            );
        }
        if !session.status.is_terminal() {
            self.save_snapshot(session);
        }
    }

    async fn describe(
        &self,
        image_ref: &str,
        schema: &LoadedSchema,
    ) -> Result<PaldDocument, anyhow::Error> {
        let description = self.describer.describe_image(image_ref).await?;
        let raw = self
            .extractor
            .extract_pald(&description.description_text)
            .await?;
        Ok(schema.validate(&flatten(&raw)))
    }

    fn fail_generation(&self, session: &mut ConsistencySession, error: String) {
        log::error!(
            "Image generation failed for session {}: {}",
            session.session_id,
            error
        );
        session.last_error = Some(error);
        session.outcome = Some(TurnOutcome::GenerationFailed);
        session.transition(SessionStatus::Idle);
    }

    /// Handle a parked stop/accept request. Returns true when the loop
    /// must end.
    fn apply_cancel(&self, session: &mut ConsistencySession, slot: &SessionSlot) -> bool {
        match slot.take_cancel() {
            None => false,
            Some(CancelRequest::AcceptCurrent) if session.image_ref.is_some() => {
                self.terminate(
                    session,
                    Some(TurnOutcome::Accepted {
                        reason: AcceptReason::UserAccepted,
                    }),
                );
                true
            }
            Some(_) => {
                self.terminate(session, Some(TurnOutcome::Stopped));
                true
            }
        }
    }

    fn save_snapshot(&self, session: &ConsistencySession) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_snapshot(session) {
                log::warn!(
                    "Failed to save snapshot for session {}: {}",
                    session.session_id,
                    e
                );
            }
        }
    }
}

fn ensure_not_terminal(session: &ConsistencySession, operation: &str) -> Result<(), PipelineError> {
    if session.status.is_terminal() {
        return Err(PipelineError::InvalidState {
            operation: operation.to_string(),
            state: session.status.to_string(),
        });
    }
    Ok(())
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consistency::testing::{
        controller_with, schema, ScriptedDescriber, ScriptedExtractor, ScriptedGenerator,
    };
    use crate::federated::{SignalCollector, SignalKind};
    use crate::pald::{ConsistencyReport, Recommendation};
    use crate::persistence::InMemorySessionStore;
    use crate::services::GenerationResult;
    use serde_json::json;

    const INPUT: &str = "a woman with a ponytail";

    fn extractor() -> ScriptedExtractor {
        ScriptedExtractor::new()
            .respond(
                INPUT,
                json!({
                    "global": {"gender": "female"},
                    "detail": {"hair": {"style": "ponytail"}}
                }),
            )
            .respond(
                "matching",
                json!({"global.gender": "female", "detail.hair.style": "ponytail"}),
            )
            .respond("half", json!({"global.gender": "male", "detail.hair.style": "ponytail"}))
            .respond("nothing", json!({}))
    }

    #[tokio::test]
    async fn test_iteration_cap_accepts_after_max() {
        let generator = Arc::new(ScriptedGenerator::new());
        let describer = Arc::new(ScriptedDescriber::always("nothing"));
        let controller = controller_with(Arc::new(extractor()), generator.clone(), describer, 3);

        let mut session = controller.open_session(Pseudonym::new("p-1")).unwrap();
        let result = controller.process_turn(&mut session, INPUT).await.unwrap();

        assert!(result.pald_extracted);
        assert_eq!(result.status, SessionStatus::Accepted);
        assert_eq!(session.accept_reason(), Some(AcceptReason::IterationCap));
        assert_eq!(session.iteration, 3);
        assert_eq!(generator.calls(), 3);
        assert_eq!(session.consistency_score, Some(0.0));
    }

    #[tokio::test]
    async fn test_threshold_met_on_first_iteration() {
        let generator = Arc::new(ScriptedGenerator::new());
        let describer = Arc::new(ScriptedDescriber::always("matching"));
        let controller = controller_with(Arc::new(extractor()), generator.clone(), describer, 3);

        let mut session = controller.open_session(Pseudonym::new("p-1")).unwrap();
        controller.process_turn(&mut session, INPUT).await.unwrap();

        assert_eq!(session.accept_reason(), Some(AcceptReason::ThresholdMet));
        assert_eq!(generator.calls(), 1);
        assert_eq!(session.consistency_score, Some(1.0));
        assert!(session.diff_keys.is_empty());
        assert_eq!(session.image_ref.as_deref(), Some("img-1"));
    }

    #[tokio::test]
    async fn test_regeneration_uses_input_document() {
        let generator = Arc::new(ScriptedGenerator::new());
        let describer = Arc::new(ScriptedDescriber::always("half"));
        let controller = controller_with(Arc::new(extractor()), generator.clone(), describer, 2);

        let mut session = controller.open_session(Pseudonym::new("p-1")).unwrap();
        controller.process_turn(&mut session, INPUT).await.unwrap();

        let requests = generator.requests();
        assert_eq!(requests.len(), 2);
        for (i, request) in requests.iter().enumerate() {
            assert_eq!(request.pald, session.input_pald);
            assert_eq!(request.iteration, i as u32 + 1);
        }
        assert_eq!(session.diff_keys, vec!["global.gender".to_string()]);
    }

    #[derive(Debug)]
    struct AlwaysAccept;

    impl ConsistencyScorer for AlwaysAccept {
        fn score(&self, _input: &PaldDocument, _described: &PaldDocument) -> ConsistencyReport {
            ConsistencyReport {
                score: f64::NAN,
                diff_keys: Vec::new(),
                matched_keys: Vec::new(),
                recommendation: Some(Recommendation::Accept),
            }
        }
    }

    #[tokio::test]
    async fn test_scorer_recommendation_accepts() {
        let generator = Arc::new(ScriptedGenerator::new());
        let describer = Arc::new(ScriptedDescriber::always("nothing"));
        let controller = controller_with(Arc::new(extractor()), generator.clone(), describer, 5)
            .with_scorer(Arc::new(AlwaysAccept));

        let mut session = controller.open_session(Pseudonym::new("p-1")).unwrap();
        controller.process_turn(&mut session, INPUT).await.unwrap();

        assert_eq!(
            session.accept_reason(),
            Some(AcceptReason::ScorerRecommendation)
        );
        assert_eq!(session.consistency_score, Some(0.0));
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_extraction_skips_generation() {
        let generator = Arc::new(ScriptedGenerator::new());
        let describer = Arc::new(ScriptedDescriber::always("matching"));
        let controller = controller_with(Arc::new(extractor()), generator.clone(), describer, 3);

        let mut session = controller.open_session(Pseudonym::new("p-1")).unwrap();
        let result = controller
            .process_turn(&mut session, "unknown text")
            .await
            .unwrap();

        assert!(!result.pald_extracted);
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(session.outcome, Some(TurnOutcome::NoAttributes));
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_extraction_error_is_treated_as_empty() {
        let generator = Arc::new(ScriptedGenerator::new());
        let describer = Arc::new(ScriptedDescriber::always("matching"));
        let controller = controller_with(
            Arc::new(extractor().fail_on("broken")),
            generator.clone(),
            describer,
            3,
        );

        let mut session = controller.open_session(Pseudonym::new("p-1")).unwrap();
        let result = controller.process_turn(&mut session, "broken").await.unwrap();

        assert!(!result.pald_extracted);
        assert_eq!(session.outcome, Some(TurnOutcome::NoAttributes));
        assert!(session.last_error.is_some());
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_auto_generate_disabled() {
        let generator = Arc::new(ScriptedGenerator::new());
        let describer = Arc::new(ScriptedDescriber::always("matching"));
        let controller = ConsistencyController::new(
            PipelineConfig {
                auto_generate_images: false,
                ..PipelineConfig::default()
            },
            SchemaProvider::fixed(schema()),
            Arc::new(extractor()),
            generator.clone(),
            describer,
        );

        let mut session = controller.open_session(Pseudonym::new("p-1")).unwrap();
        let result = controller.process_turn(&mut session, INPUT).await.unwrap();

        assert!(result.pald_extracted);
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(session.outcome, Some(TurnOutcome::GenerationDisabled));
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_generation_failure_returns_to_idle() {
        let generator = Arc::new(
            ScriptedGenerator::new().push(Ok(GenerationResult::failed("gpu out of memory"))),
        );
        let describer = Arc::new(ScriptedDescriber::always("matching"));
        let controller = controller_with(Arc::new(extractor()), generator.clone(), describer, 3);

        let mut session = controller.open_session(Pseudonym::new("p-1")).unwrap();
        controller.process_turn(&mut session, INPUT).await.unwrap();

        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(session.outcome, Some(TurnOutcome::GenerationFailed));
        assert_eq!(session.last_error.as_deref(), Some("gpu out of memory"));
        assert!(session.image_ref.is_none());
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_generation_error_after_image_accepts_partial() {
        let generator = Arc::new(
            ScriptedGenerator::new()
                .push(Ok(GenerationResult::ok("first")))
                .push(Err("connection reset".to_string())),
        );
        let describer = Arc::new(ScriptedDescriber::always("half"));
        let controller = controller_with(Arc::new(extractor()), generator.clone(), describer, 3);

        let mut session = controller.open_session(Pseudonym::new("p-1")).unwrap();
        controller.process_turn(&mut session, INPUT).await.unwrap();

        assert_eq!(session.accept_reason(), Some(AcceptReason::PartialResult));
        assert_eq!(session.image_ref.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_description_failure_accepts_image() {
        let generator = Arc::new(ScriptedGenerator::new());
        let describer = Arc::new(ScriptedDescriber::failing("captioner offline"));
        let controller = controller_with(Arc::new(extractor()), generator.clone(), describer, 3);

        let mut session = controller.open_session(Pseudonym::new("p-1")).unwrap();
        controller.process_turn(&mut session, INPUT).await.unwrap();

        assert_eq!(
            session.accept_reason(),
            Some(AcceptReason::DescriptionUnavailable)
        );
        assert_eq!(session.image_ref.as_deref(), Some("img-1"));
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_terminal_session_rejects_turns() {
        let generator = Arc::new(ScriptedGenerator::new());
        let describer = Arc::new(ScriptedDescriber::always("matching"));
        let controller = controller_with(Arc::new(extractor()), generator, describer, 3);

        let mut session = controller.open_session(Pseudonym::new("p-1")).unwrap();
        controller.terminate(&mut session, Some(TurnOutcome::Stopped));

        let err = controller.process_turn(&mut session, INPUT).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState { .. }));
        assert!(controller.open_session(Pseudonym::new("p-1")).is_ok());
    }

    #[tokio::test]
    async fn test_second_session_for_participant_rejected() {
        let controller = controller_with(
            Arc::new(extractor()),
            Arc::new(ScriptedGenerator::new()),
            Arc::new(ScriptedDescriber::always("matching")),
            3,
        );
        controller.open_session(Pseudonym::new("p-1")).unwrap();
        assert!(matches!(
            controller.open_session(Pseudonym::new("p-1")),
            Err(PipelineError::SessionAlreadyActive { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_mid_generation_discards_result() {
        let generator = Arc::new(ScriptedGenerator::gated());
        let describer = Arc::new(ScriptedDescriber::always("matching"));
        let controller = Arc::new(controller_with(
            Arc::new(extractor()),
            generator.clone(),
            describer,
            3,
        ));

        let session = controller.open_session(Pseudonym::new("p-1")).unwrap();
        let mut copy = session.clone();

        let task = {
            let controller = Arc::clone(&controller);
            let mut session = session;
            tokio::spawn(async move {
                let result = controller.process_turn(&mut session, INPUT).await;
                (session, result)
            })
        };

        generator.wait_started().await;
        let busy = controller.run_consistency_pipeline(&mut copy).await;
        assert!(matches!(busy, Err(PipelineError::ParticipantBusy { .. })));

        assert!(controller.cancel(&Pseudonym::new("p-1"), CancelRequest::Stop));
        generator.release();

        let (session, result) = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(session.status, SessionStatus::Terminal);
        assert_eq!(session.outcome, Some(TurnOutcome::Stopped));
        assert!(session.image_ref.is_none());
        assert_eq!(controller.registry().active_count(), 0);
    }

    #[tokio::test]
    async fn test_accept_mid_generation_keeps_previous_image() {
        let generator = Arc::new(ScriptedGenerator::gated_from(2));
        let describer = Arc::new(ScriptedDescriber::always("half"));
        let controller = Arc::new(controller_with(
            Arc::new(extractor()),
            generator.clone(),
            describer,
            3,
        ));

        let session = controller.open_session(Pseudonym::new("p-1")).unwrap();
        let task = {
            let controller = Arc::clone(&controller);
            let mut session = session;
            tokio::spawn(async move {
                let result = controller.process_turn(&mut session, INPUT).await;
                (session, result)
            })
        };

        generator.wait_started().await;
        assert!(controller.cancel(&Pseudonym::new("p-1"), CancelRequest::AcceptCurrent));
        generator.release();

        let (session, result) = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(session.status, SessionStatus::Terminal);
        assert_eq!(session.accept_reason(), Some(AcceptReason::UserAccepted));
        assert_eq!(session.image_ref.as_deref(), Some("img-1"));
        assert_eq!(session.iteration, 2);
        assert_eq!(generator.calls(), 2);
        assert_eq!(controller.registry().active_count(), 0);
    }

    #[tokio::test]
    async fn test_reextraction_failure_accepts_image() {
        let generator = Arc::new(ScriptedGenerator::new());
        let describer = Arc::new(ScriptedDescriber::always("blurry caption"));
        let controller = controller_with(
            Arc::new(extractor().fail_on("blurry caption")),
            generator.clone(),
            describer,
            3,
        );

        let mut session = controller.open_session(Pseudonym::new("p-1")).unwrap();
        controller.process_turn(&mut session, INPUT).await.unwrap();

        assert_eq!(
            session.accept_reason(),
            Some(AcceptReason::DescriptionUnavailable)
        );
        assert_eq!(session.image_ref.as_deref(), Some("img-1"));
        assert!(session.description_pald.is_none());
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_parked_while_idle_applies_to_next_turn() {
        let generator = Arc::new(ScriptedGenerator::new());
        let controller = controller_with(
            Arc::new(extractor()),
            generator.clone(),
            Arc::new(ScriptedDescriber::always("matching")),
            3,
        );

        let mut session = controller.open_session(Pseudonym::new("p-1")).unwrap();
        assert!(controller.cancel(&session.pseudonym, CancelRequest::Stop));

        controller.process_turn(&mut session, INPUT).await.unwrap();
        assert_eq!(session.status, SessionStatus::Terminal);
        assert_eq!(session.outcome, Some(TurnOutcome::Stopped));
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_signals_emitted_when_enabled() {
        let collector = SignalCollector::new();
        let controller = controller_with(
            Arc::new(extractor()),
            Arc::new(ScriptedGenerator::new()),
            Arc::new(ScriptedDescriber::always("half")),
            1,
        )
        .with_signal_sink(Arc::new(collector.clone()));

        let mut session = controller.open_session(Pseudonym::new("p-1")).unwrap();
        controller.process_turn(&mut session, INPUT).await.unwrap();

        let status = collector.status();
        assert_eq!(status.by_kind.get(&SignalKind::PaldSlot), Some(&2));
        assert_eq!(status.by_kind.get(&SignalKind::ConsistencyLabel), Some(&2));

        let labels: Vec<f64> = collector
            .snapshot()
            .iter()
            .filter(|s| s.kind() == SignalKind::ConsistencyLabel)
            .map(|s| s.measure())
            .collect();
        assert!(labels.contains(&1.0));
        assert!(labels.contains(&0.0));
    }

    #[tokio::test]
    async fn test_snapshot_saved_at_turn_end() {
        let store = Arc::new(InMemorySessionStore::new());
        let controller = controller_with(
            Arc::new(extractor()),
            Arc::new(ScriptedGenerator::new()),
            Arc::new(ScriptedDescriber::always("matching")),
            3,
        )
        .with_store(store.clone());

        let mut session = controller.open_session(Pseudonym::new("p-1")).unwrap();
        controller.process_turn(&mut session, INPUT).await.unwrap();

        let saved = store.load_latest(session.session_id).unwrap().unwrap();
        assert_eq!(saved.status, SessionStatus::Accepted);
        assert_eq!(store.snapshot_count(session.session_id).unwrap(), 1);
    }
}
