//! Session registry: bounded creation, lookup and teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use kiln_core::{EventEmitter, KilnError, SessionId};
use kiln_settings::GenerationConfig;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::session::types::{SessionState, SessionType};
use crate::session::{Services, Session};

/// Observer notification from the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A session was admitted.
    Created {
        /// New session.
        id: SessionId,
        /// Its type.
        kind: SessionType,
    },
    /// A session was stopped and removed.
    Destroyed {
        /// Removed session.
        id: SessionId,
    },
}

/// Counts over the live sessions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatistics {
    /// Live sessions.
    pub total: usize,
    /// Admission cap.
    pub max_sessions: usize,
    /// Sessions in `Idle`.
    pub idle: usize,
    /// Sessions in `Generating`.
    pub generating: usize,
    /// Sessions in `Paused`.
    pub paused: usize,
    /// Sessions in `Stopped`.
    pub stopped: usize,
    /// Sessions in `Error`.
    pub errored: usize,
    /// Chat sessions.
    pub chat: usize,
    /// Completion sessions.
    pub completion: usize,
    /// Embedding sessions.
    pub embedding: usize,
    /// Multimodal sessions.
    pub multimodal: usize,
    /// Tokens generated across live sessions.
    pub total_tokens_generated: u64,
}

/// Owns every live [`Session`] and enforces the session cap.
///
/// The cap is admission control: a create beyond it fails with
/// [`KilnError::SessionLimitReached`]; nothing is queued.
pub struct SessionRegistry {
    services: Services,
    defaults: GenerationConfig,
    sessions: DashMap<SessionId, Arc<Session>>,
    max_sessions: AtomicUsize,
    admission: Mutex<()>,
    events: EventEmitter<RegistryEvent>,
}

impl SessionRegistry {
    pub(crate) fn new(services: Services, max_sessions: usize, defaults: GenerationConfig) -> Self {
        Self {
            services,
            defaults,
            sessions: DashMap::new(),
            max_sessions: AtomicUsize::new(max_sessions.max(1)),
            admission: Mutex::new(()),
            events: EventEmitter::new(),
        }
    }

    // ── Capacity ────────────────────────────────────────────────────

    /// Admission cap.
    pub fn max_sessions(&self) -> usize {
        self.max_sessions.load(Ordering::Acquire)
    }

    /// Change the admission cap. Live sessions above it are kept.
    pub fn set_max_sessions(&self, max: usize) -> kiln_core::Result<()> {
        if max == 0 {
            return Err(KilnError::invalid_argument("maxConcurrentSessions must be positive"));
        }
        self.max_sessions.store(max, Ordering::Release);
        Ok(())
    }

    /// Live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// No live sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    // ── Creation ────────────────────────────────────────────────────

    /// Create a session with a fresh ID.
    pub fn create(&self, kind: SessionType) -> kiln_core::Result<Arc<Session>> {
        self.create_with_id(kind, SessionId::new())
    }

    /// Create a session with a caller-chosen ID.
    #[instrument(skip(self, id), fields(session_id = %id))]
    pub fn create_with_id(&self, kind: SessionType, id: SessionId) -> kiln_core::Result<Arc<Session>> {
        let session = {
            let _admission = self.admission.lock();
            let max = self.max_sessions();
            if self.sessions.len() >= max {
                warn!(max, "session limit reached");
                return Err(KilnError::SessionLimitReached(max));
            }
            if self.sessions.contains_key(&id) {
                return Err(KilnError::invalid_argument(format!(
                    "session {id} already exists"
                )));
            }
            let session = Session::new(
                id.clone(),
                kind,
                self.defaults.clone(),
                self.services.clone(),
            );
            let _ = self.sessions.insert(id.clone(), Arc::clone(&session));
            session
        };
        debug!(kind = ?kind, "session created");
        let _ = self.events.emit(RegistryEvent::Created { id, kind });
        Ok(session)
    }

    /// Chat session with an optional system prompt and sampling parameters.
    pub fn create_chat_session(
        &self,
        system_prompt: Option<String>,
        config: Option<GenerationConfig>,
    ) -> kiln_core::Result<Arc<Session>> {
        let session = self.create(SessionType::Chat)?;
        session.set_system_prompt(system_prompt);
        if let Some(config) = config {
            session.set_generation_config(config);
        }
        Ok(session)
    }

    /// Completion session with optional sampling parameters.
    pub fn create_completion_session(
        &self,
        config: Option<GenerationConfig>,
    ) -> kiln_core::Result<Arc<Session>> {
        let session = self.create(SessionType::Completion)?;
        if let Some(config) = config {
            session.set_generation_config(config);
        }
        Ok(session)
    }

    /// Chat session tuned for short, fast replies.
    pub fn create_quick_chat_session(&self) -> kiln_core::Result<Arc<Session>> {
        self.create_chat_session(None, Some(GenerationConfig::fast()))
    }

    /// Chat session with high-temperature sampling.
    pub fn create_creative_chat_session(&self) -> kiln_core::Result<Arc<Session>> {
        self.create_chat_session(None, Some(GenerationConfig::creative()))
    }

    /// Chat session with low-temperature sampling.
    pub fn create_precise_chat_session(&self) -> kiln_core::Result<Arc<Session>> {
        self.create_chat_session(None, Some(GenerationConfig::precise()))
    }

    // ── Lookup ──────────────────────────────────────────────────────

    /// Session by ID.
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Session by ID, or [`KilnError::SessionNotFound`].
    pub fn require(&self, id: &SessionId) -> kiln_core::Result<Arc<Session>> {
        self.get(id)
            .ok_or_else(|| KilnError::SessionNotFound(id.to_string()))
    }

    /// Every live session, oldest first.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        sessions.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        sessions
    }

    /// Live sessions of one type.
    pub fn sessions_of_type(&self, kind: SessionType) -> Vec<Arc<Session>> {
        self.sessions_matching(|s| s.kind() == kind)
    }

    /// Live sessions in one state.
    pub fn sessions_in_state(&self, state: SessionState) -> Vec<Arc<Session>> {
        self.sessions_matching(|s| s.state() == state)
    }

    /// Chat sessions that are neither stopped nor failed.
    pub fn active_chat_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions_matching(|s| {
            s.kind() == SessionType::Chat
                && !matches!(s.state(), SessionState::Stopped | SessionState::Error)
        })
    }

    fn sessions_matching(&self, predicate: impl Fn(&Session) -> bool) -> Vec<Arc<Session>> {
        self.sessions()
            .into_iter()
            .filter(|s| predicate(s.as_ref()))
            .collect()
    }

    // ── Teardown ────────────────────────────────────────────────────

    /// Stop a session, cancelling its work, and remove it.
    #[instrument(skip(self, id), fields(session_id = %id))]
    pub fn destroy(&self, id: &SessionId) -> bool {
        let Some((_, session)) = self.sessions.remove(id) else {
            return false;
        };
        session.stop();
        debug!("session destroyed");
        let _ = self.events.emit(RegistryEvent::Destroyed { id: id.clone() });
        true
    }

    /// Destroy every session. Returns how many were removed.
    pub fn destroy_all(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let destroyed = ids.iter().filter(|id| self.destroy(id)).count();
        if destroyed > 0 {
            info!(destroyed, "all sessions destroyed");
        }
        destroyed
    }

    // ── Bulk control ────────────────────────────────────────────────

    /// Pause every session.
    pub fn pause_all(&self) {
        self.sessions().iter().for_each(|s| s.pause());
    }

    /// Resume every paused session.
    pub fn resume_all(&self) {
        self.sessions().iter().for_each(|s| s.resume());
    }

    /// Stop every session without removing it.
    pub fn stop_all(&self) {
        self.sessions().iter().for_each(|s| s.stop());
    }

    // ── Observability ───────────────────────────────────────────────

    /// Counts by state and type.
    pub fn statistics(&self) -> RegistryStatistics {
        let mut stats = RegistryStatistics {
            max_sessions: self.max_sessions(),
            ..RegistryStatistics::default()
        };
        for session in self.sessions() {
            stats.total += 1;
            match session.state() {
                SessionState::Idle => stats.idle += 1,
                SessionState::Generating => stats.generating += 1,
                SessionState::Paused => stats.paused += 1,
                SessionState::Stopped => stats.stopped += 1,
                SessionState::Error => stats.errored += 1,
            }
            match session.kind() {
                SessionType::Chat => stats.chat += 1,
                SessionType::Completion => stats.completion += 1,
                SessionType::Embedding => stats.embedding += 1,
                SessionType::Multimodal => stats.multimodal += 1,
            }
            stats.total_tokens_generated += session.stats().total_tokens_generated;
        }
        stats
    }

    /// Subscribe to creation and destruction events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("max_sessions", &self.max_sessions())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::services;
    use assert_matches::assert_matches;
    use kiln_engine::testing::ScriptedBackend;

    fn registry(max: usize) -> SessionRegistry {
        SessionRegistry::new(
            services(ScriptedBackend::new(["ok"])),
            max,
            GenerationConfig::default(),
        )
    }

    #[tokio::test]
    async fn cap_is_enforced_and_destroy_frees_one_slot() {
        let registry = registry(2);
        let a = registry.create(SessionType::Chat).unwrap();
        let _b = registry.create(SessionType::Completion).unwrap();
        assert_matches!(
            registry.create(SessionType::Chat),
            Err(KilnError::SessionLimitReached(2))
        );

        assert!(registry.destroy(a.id()));
        assert_eq!(a.state(), SessionState::Stopped);
        assert!(registry.create(SessionType::Chat).is_ok());
        assert_matches!(
            registry.create(SessionType::Chat),
            Err(KilnError::SessionLimitReached(2))
        );
    }

    #[tokio::test]
    async fn default_cap_matches_settings() {
        let registry = registry(kiln_settings::SessionSettings::default().max_concurrent_sessions);
        for _ in 0..5 {
            let _ = registry.create(SessionType::Chat).unwrap();
        }
        assert!(registry.create(SessionType::Chat).is_err());
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let registry = registry(5);
        let id = SessionId::from("fixed");
        let _ = registry.create_with_id(SessionType::Chat, id.clone()).unwrap();
        assert_matches!(
            registry.create_with_id(SessionType::Chat, id),
            Err(KilnError::InvalidArgument(_))
        );
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn lookup_and_queries() {
        let registry = registry(5);
        let chat = registry.create(SessionType::Chat).unwrap();
        let embed = registry.create(SessionType::Embedding).unwrap();
        embed.pause();

        assert!(registry.get(chat.id()).is_some());
        assert_matches!(
            registry.require(&SessionId::from("missing")),
            Err(KilnError::SessionNotFound(_))
        );
        assert_eq!(registry.sessions_of_type(SessionType::Embedding).len(), 1);
        assert_eq!(registry.sessions_in_state(SessionState::Paused).len(), 1);
        assert_eq!(registry.active_chat_sessions().len(), 1);
        chat.stop();
        assert!(registry.active_chat_sessions().is_empty());
    }

    #[tokio::test]
    async fn bulk_control_and_statistics() {
        let registry = registry(5);
        let _ = registry.create(SessionType::Chat).unwrap();
        let _ = registry.create(SessionType::Multimodal).unwrap();

        registry.pause_all();
        assert_eq!(registry.statistics().paused, 2);
        registry.resume_all();
        assert_eq!(registry.statistics().idle, 2);
        registry.stop_all();

        let stats = registry.statistics();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.stopped, 2);
        assert_eq!(stats.chat, 1);
        assert_eq!(stats.multimodal, 1);
        assert_eq!(stats.max_sessions, 5);
    }

    #[tokio::test]
    async fn templates_apply_presets() {
        let registry = registry(5);
        let quick = registry.create_quick_chat_session().unwrap();
        assert_eq!(quick.generation_config(), GenerationConfig::fast());
        let precise = registry.create_precise_chat_session().unwrap();
        assert_eq!(precise.generation_config(), GenerationConfig::precise());
        let creative = registry.create_creative_chat_session().unwrap();
        assert_eq!(creative.kind(), SessionType::Chat);

        let chat = registry
            .create_chat_session(Some("be brief".into()), None)
            .unwrap();
        assert_eq!(chat.system_prompt().as_deref(), Some("be brief"));
        assert_eq!(chat.generation_config(), GenerationConfig::default());

        let completion = registry.create_completion_session(None).unwrap();
        assert_eq!(completion.kind(), SessionType::Completion);
    }

    #[tokio::test]
    async fn events_and_destroy_all() {
        let registry = registry(5);
        let mut events = registry.subscribe();
        let session = registry.create(SessionType::Chat).unwrap();
        let _ = registry.create(SessionType::Chat).unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::Created {
                id: session.id().clone(),
                kind: SessionType::Chat
            }
        );
        assert_eq!(registry.destroy_all(), 2);
        assert!(registry.is_empty());
        assert!(!registry.destroy(session.id()));
    }

    #[tokio::test]
    async fn cap_changes() {
        let registry = registry(1);
        assert_matches!(registry.set_max_sessions(0), Err(KilnError::InvalidArgument(_)));
        registry.set_max_sessions(3).unwrap();
        for _ in 0..3 {
            let _ = registry.create(SessionType::Chat).unwrap();
        }
        assert_eq!(registry.statistics().total, 3);
    }
}
