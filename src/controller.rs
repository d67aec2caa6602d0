//! Conversation orchestration.
//!
//! The controller turns chat events — start, cancel, an incoming photo, a
//! text reply — into state transitions and reply messages. It owns no
//! policy of its own: extraction behavior lives in the extractors, storage
//! in the ingestor, delivery in the gateway. Every handler returns the
//! list of messages to send back to the user.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::aggregate::merge;
use crate::config::Settings;
use crate::gateway::SubmissionGateway;
use crate::pipeline::extract::{extraction_succeeded, ExtractorFactory, STATUS_KEY, STATUS_NO_DATA};
use crate::pipeline::ingest::{ImageIngestor, PhotoSource};
use crate::pipeline::parse::render_fields;
use crate::pipeline::prompts::declared_labels;
use crate::session::{DocumentKind, SessionStore, Stage};

/// Temp files older than this are considered crash leftovers.
const ORPHAN_MAX_AGE: Duration = Duration::from_secs(3600);

const NO_SESSION_MSG: &str = "No intake is in progress. Send /start to begin.";

pub struct IntakeController {
    sessions: SessionStore,
    ingestor: ImageIngestor,
    factory: Arc<ExtractorFactory>,
    gateway: Arc<dyn SubmissionGateway>,
    source: Arc<dyn PhotoSource>,
    identity_timeout: Duration,
}

impl IntakeController {
    pub fn new(
        ingestor: ImageIngestor,
        factory: Arc<ExtractorFactory>,
        gateway: Arc<dyn SubmissionGateway>,
        source: Arc<dyn PhotoSource>,
        identity_timeout: Duration,
    ) -> Self {
        Self {
            sessions: SessionStore::new(),
            ingestor,
            factory,
            gateway,
            source,
            identity_timeout,
        }
    }

    /// Convenience constructor wiring storage and timing from settings.
    pub fn from_settings(
        settings: &Settings,
        factory: Arc<ExtractorFactory>,
        gateway: Arc<dyn SubmissionGateway>,
        source: Arc<dyn PhotoSource>,
    ) -> Self {
        let ingestor = ImageIngestor::new(
            &settings.temp_dir,
            &settings.archive_dir,
            settings.fetch_retries,
            settings.fetch_retry_delay,
        );
        Self::new(
            ingestor,
            factory,
            gateway,
            source,
            settings.identity_timeout,
        )
    }

    /// Begin (or restart) an intake for a user.
    pub async fn handle_start(&self, user_id: i64) -> Vec<String> {
        // Opportunistic sweep of crash leftovers; failures are not the
        // user's problem.
        if let Err(e) = self.ingestor.cleanup_orphaned_temp_files(ORPHAN_MAX_AGE) {
            warn!(error = %e, "Orphaned temp file sweep failed");
        }
        let stage = self.sessions.begin(user_id);
        vec![
            "Welcome! I'll walk you through your vehicle intake. Send /cancel at any time to stop."
                .to_string(),
            prompt_for(stage).unwrap_or_default(),
        ]
    }

    /// Abort an in-flight intake.
    pub async fn handle_cancel(&self, user_id: i64) -> Vec<String> {
        match self.sessions.take(user_id) {
            Some(_) => {
                info!(user_id, "Intake cancelled");
                vec!["Your intake has been cancelled. Send /start to begin again.".to_string()]
            }
            None => vec![NO_SESSION_MSG.to_string()],
        }
    }

    /// Process a photo the user just sent.
    pub async fn handle_photo(&self, user_id: i64) -> Vec<String> {
        let Some(stage) = self.sessions.stage(user_id) else {
            return vec![NO_SESSION_MSG.to_string()];
        };
        let Some(kind) = stage.expected_document() else {
            return match prompt_for(stage) {
                Some(prompt) => vec![format!("I need a text reply right now, not a photo. {prompt}")],
                None => vec![NO_SESSION_MSG.to_string()],
            };
        };

        let staged = match self.ingestor.stage(self.source.as_ref(), user_id, kind).await {
            Ok(staged) => staged,
            Err(e) => {
                warn!(user_id, error = %e, "Photo acquisition failed");
                return vec![format!(
                    "I couldn't use that photo ({e}). Please send your {} again.",
                    kind.display_name()
                )];
            }
        };

        let Some(extractor) = self.factory.for_kind(kind) else {
            error!(%kind, "No extractor for photo-bearing stage");
            return vec![NO_SESSION_MSG.to_string()];
        };

        // Extraction is CPU/model-bound and must not block the runtime.
        // `staged` stays on this side so the temp copy is removed even
        // when the identity budget expires mid-extraction.
        let image_path = staged.saved_path().to_path_buf();
        let task = tokio::task::spawn_blocking(move || extractor.extract(&image_path));
        let fields = if kind == DocumentKind::IdCard {
            match tokio::time::timeout(self.identity_timeout, task).await {
                Ok(Ok(fields)) => fields,
                Ok(Err(e)) => {
                    error!(user_id, error = %e, "Extraction task panicked");
                    return vec![retry_message(kind, "Image processing failed")];
                }
                Err(_) => {
                    warn!(user_id, timeout_secs = self.identity_timeout.as_secs(), "Identity extraction timed out");
                    return vec![format!(
                        "Reading your {} took too long. Please send the photo again.",
                        kind.display_name()
                    )];
                }
            }
        } else {
            match task.await {
                Ok(fields) => fields,
                Err(e) => {
                    error!(user_id, error = %e, "Extraction task panicked");
                    return vec![retry_message(kind, "Image processing failed")];
                }
            }
        };

        // Extraction over; the temp copy has served its purpose either way.
        drop(staged);

        if !extraction_succeeded(&fields, kind) {
            let reason = fields
                .get(STATUS_KEY)
                .map(String::as_str)
                .unwrap_or(STATUS_NO_DATA);
            return vec![retry_message(kind, reason)];
        }

        let rendered = render_fields(&fields, declared_labels(kind));
        self.sessions.with_session(user_id, |s| s.record(kind, fields));

        let mut replies = vec![format!(
            "Here's what I read from your {}:\n{rendered}",
            kind.display_name()
        )];
        if let Some(prompt) = self.sessions.stage(user_id).and_then(prompt_for) {
            replies.push(prompt);
        }
        replies
    }

    /// Process a text reply. Only the referral stages accept text; the
    /// last answer completes the intake and triggers submission.
    pub async fn handle_text(&self, user_id: i64, text: &str) -> Vec<String> {
        let Some(stage) = self.sessions.stage(user_id) else {
            return vec![NO_SESSION_MSG.to_string()];
        };
        if stage.referral_field().is_none() {
            return match prompt_for(stage) {
                Some(prompt) => vec![format!("I'm waiting for a photo right now. {prompt}")],
                None => vec![NO_SESSION_MSG.to_string()],
            };
        }

        let advanced = self
            .sessions
            .with_session(user_id, |s| s.record_referral_answer(text))
            .unwrap_or(false);
        if !advanced {
            return vec![format!(
                "That can't be empty. {}",
                prompt_for(stage).unwrap_or_default()
            )];
        }

        match self.sessions.stage(user_id) {
            Some(Stage::Done) => self.finalize(user_id).await,
            Some(next) => prompt_for(next).into_iter().collect(),
            None => vec![NO_SESSION_MSG.to_string()],
        }
    }

    /// Merge, submit, and close out a completed session.
    async fn finalize(&self, user_id: i64) -> Vec<String> {
        let Some(session) = self.sessions.take(user_id) else {
            return vec![NO_SESSION_MSG.to_string()];
        };
        let record = merge(&session.documents);
        info!(user_id, fields = record.len(), "Submitting completed intake");

        let gateway = self.gateway.clone();
        let accepted = tokio::task::spawn_blocking(move || gateway.submit(&record))
            .await
            .unwrap_or(false);

        if accepted {
            vec!["All done! Your details have been submitted. We'll be in touch shortly."
                .to_string()]
        } else {
            // The intake still completes; delivery gets retried by a human.
            error!(user_id, "Board submission failed for completed intake");
            vec![
                "All done! We couldn't file your details automatically, so our team will \
                 process them manually and be in touch shortly."
                    .to_string(),
            ]
        }
    }
}

fn retry_message(kind: DocumentKind, reason: &str) -> String {
    format!(
        "I couldn't read your {} ({reason}). Please send a clearer photo.",
        kind.display_name()
    )
}

/// What to ask the user for at a given stage. Terminal stages prompt
/// nothing.
fn prompt_for(stage: Stage) -> Option<String> {
    let prompt = match stage {
        Stage::AwaitIdentity => "Please send a clear photo of your identity card.",
        Stage::AwaitLicense => "Please send a clear photo of your driver's license.",
        Stage::AwaitLogCard => "Please send a clear photo of your vehicle log card.",
        Stage::AwaitReferrerName => "Who referred you? Please reply with the referrer's name.",
        Stage::AwaitReferrerContact => "What is the referrer's contact number?",
        Stage::AwaitReferrerDealership => "Which dealership is the referrer from?",
        Stage::Done | Stage::Cancelled => return None,
    };
    Some(prompt.to_string())
}
