//! Per-user conversation state.
//!
//! An intake session walks a fixed sequence of stages: three document
//! photos, then three free-text referral answers. Sessions live in a
//! process-wide in-memory store keyed by chat user id; restarting the
//! intake replaces any existing session for that user.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// Extracted fields for one document: declared label → value. Every
/// declared label is always present; absence is the `"Not found"` sentinel,
/// never a missing key.
pub type FieldMap = BTreeMap<String, String>;

/// The document and text categories an intake collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DocumentKind {
    IdCard,
    License,
    LogCard,
    Referral,
}

impl DocumentKind {
    /// Stable tag used for storage directories and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::IdCard => "id_card",
            DocumentKind::License => "license",
            DocumentKind::LogCard => "log_card",
            DocumentKind::Referral => "referral",
        }
    }

    /// Human-readable name used in conversational replies.
    pub fn display_name(&self) -> &'static str {
        match self {
            DocumentKind::IdCard => "identity card",
            DocumentKind::License => "driver's license",
            DocumentKind::LogCard => "vehicle log card",
            DocumentKind::Referral => "referral details",
        }
    }
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Conversation stage. Photo stages expect an image, referral stages expect
/// text; `Done` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AwaitIdentity,
    AwaitLicense,
    AwaitLogCard,
    AwaitReferrerName,
    AwaitReferrerContact,
    AwaitReferrerDealership,
    Done,
    Cancelled,
}

impl Stage {
    /// The stage that follows on success. Terminal stages stay put.
    pub fn next(self) -> Stage {
        match self {
            Stage::AwaitIdentity => Stage::AwaitLicense,
            Stage::AwaitLicense => Stage::AwaitLogCard,
            Stage::AwaitLogCard => Stage::AwaitReferrerName,
            Stage::AwaitReferrerName => Stage::AwaitReferrerContact,
            Stage::AwaitReferrerContact => Stage::AwaitReferrerDealership,
            Stage::AwaitReferrerDealership => Stage::Done,
            Stage::Done => Stage::Done,
            Stage::Cancelled => Stage::Cancelled,
        }
    }

    /// Which document kind a photo received at this stage belongs to.
    /// `None` for text and terminal stages.
    pub fn expected_document(self) -> Option<DocumentKind> {
        match self {
            Stage::AwaitIdentity => Some(DocumentKind::IdCard),
            Stage::AwaitLicense => Some(DocumentKind::License),
            Stage::AwaitLogCard => Some(DocumentKind::LogCard),
            _ => None,
        }
    }

    /// Which referral field a text answer at this stage fills. `None` for
    /// photo and terminal stages.
    pub fn referral_field(self) -> Option<&'static str> {
        match self {
            Stage::AwaitReferrerName => Some("Referrer's Name"),
            Stage::AwaitReferrerContact => Some("Contact Number"),
            Stage::AwaitReferrerDealership => Some("Dealership"),
            _ => None,
        }
    }

}

/// One user's in-flight intake.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: i64,
    pub stage: Stage,
    pub documents: BTreeMap<DocumentKind, FieldMap>,
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user_id: i64) -> Self {
        Self {
            user_id,
            stage: Stage::AwaitIdentity,
            documents: BTreeMap::new(),
            started_at: Utc::now(),
        }
    }

    /// Store extracted fields for a document and advance the stage.
    pub fn record(&mut self, kind: DocumentKind, fields: FieldMap) {
        debug!(user_id = self.user_id, kind = %kind, fields = fields.len(), "Recording document");
        self.documents.insert(kind, fields);
        self.stage = self.stage.next();
    }

    /// Store one referral answer under the current stage's field and
    /// advance. Returns `false` (without advancing) when the current stage
    /// does not expect text or the answer is blank.
    pub fn record_referral_answer(&mut self, answer: &str) -> bool {
        let Some(field) = self.stage.referral_field() else {
            return false;
        };
        let answer = answer.trim();
        if answer.is_empty() {
            return false;
        }
        self.documents
            .entry(DocumentKind::Referral)
            .or_default()
            .insert(field.to_string(), answer.to_string());
        self.stage = self.stage.next();
        true
    }
}

/// Process-wide session store keyed by user id.
///
/// Lock discipline: the mutex is only held for map access, never across an
/// await point or an extraction call.
#[derive(Default)]
pub struct SessionStore {
    inner: Mutex<HashMap<i64, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh session for a user, replacing any in-flight one.
    pub fn begin(&self, user_id: i64) -> Stage {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let replaced = map.insert(user_id, Session::new(user_id)).is_some();
        info!(user_id, replaced, "Intake session started");
        Stage::AwaitIdentity
    }

    pub fn stage(&self, user_id: i64) -> Option<Stage> {
        let map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.get(&user_id).map(|s| s.stage)
    }

    /// Run a closure against a user's session. Returns `None` when no
    /// session exists.
    pub fn with_session<R>(&self, user_id: i64, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.get_mut(&user_id).map(f)
    }

    /// Remove and return a user's session, e.g. when the intake completes
    /// or is cancelled.
    pub fn take(&self, user_id: i64) -> Option<Session> {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.remove(&user_id)
    }

    pub fn active_count(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_sequence_runs_to_done() {
        let mut stage = Stage::AwaitIdentity;
        let expected = [
            Stage::AwaitLicense,
            Stage::AwaitLogCard,
            Stage::AwaitReferrerName,
            Stage::AwaitReferrerContact,
            Stage::AwaitReferrerDealership,
            Stage::Done,
            Stage::Done,
        ];
        for want in expected {
            stage = stage.next();
            assert_eq!(stage, want);
        }
    }

    #[test]
    fn cancelled_stage_stays_cancelled() {
        assert_eq!(Stage::Cancelled.next(), Stage::Cancelled);
        assert_eq!(Stage::Cancelled.expected_document(), None);
        assert_eq!(Stage::Cancelled.referral_field(), None);
    }

    #[test]
    fn photo_stages_name_their_document() {
        assert_eq!(
            Stage::AwaitIdentity.expected_document(),
            Some(DocumentKind::IdCard)
        );
        assert_eq!(
            Stage::AwaitLogCard.expected_document(),
            Some(DocumentKind::LogCard)
        );
        assert_eq!(Stage::AwaitReferrerName.expected_document(), None);
        assert_eq!(Stage::Done.expected_document(), None);
    }

    #[test]
    fn record_stores_fields_and_advances() {
        let mut session = Session::new(42);
        let mut fields = FieldMap::new();
        fields.insert("Name".into(), "TAN".into());
        session.record(DocumentKind::IdCard, fields);
        assert_eq!(session.stage, Stage::AwaitLicense);
        assert_eq!(session.documents[&DocumentKind::IdCard]["Name"], "TAN");
    }

    #[test]
    fn blank_referral_answer_does_not_advance() {
        let mut session = Session::new(1);
        session.stage = Stage::AwaitReferrerDealership;
        assert!(!session.record_referral_answer("   "));
        assert_eq!(session.stage, Stage::AwaitReferrerDealership);
        assert!(session.record_referral_answer("Speed Motors"));
        assert_eq!(session.stage, Stage::Done);
        assert_eq!(
            session.documents[&DocumentKind::Referral]["Dealership"],
            "Speed Motors"
        );
    }

    #[test]
    fn referral_answer_at_photo_stage_is_rejected() {
        let mut session = Session::new(1);
        assert!(!session.record_referral_answer("hello"));
        assert_eq!(session.stage, Stage::AwaitIdentity);
    }

    #[test]
    fn begin_replaces_existing_session() {
        let store = SessionStore::new();
        store.begin(7);
        store.with_session(7, |s| s.stage = Stage::AwaitLogCard);
        store.begin(7);
        assert_eq!(store.stage(7), Some(Stage::AwaitIdentity));
        assert_eq!(store.active_count(), 1);
    }

    #[test]
    fn take_removes_the_session() {
        let store = SessionStore::new();
        store.begin(9);
        let session = store.take(9).unwrap();
        assert_eq!(session.user_id, 9);
        assert!(store.stage(9).is_none());
        assert!(store.take(9).is_none());
    }
}
