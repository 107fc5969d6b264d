/// Per-user edit session. Wires presence, events and positions together
/// and owns the optimistic save pipeline: record, emit, persist, then
/// commit or roll back on the server's answer.
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use page::{ComponentId, ComponentRegistry, PageError, Position, Props};

use crate::{
    CollaborationError, ConflictId, ConflictItem, ConflictKind, ConflictResolution,
    ConnectionStatus, EditorPresence, EventPayload, EventRouter, MoveOutcome, PositionManager,
    PresenceAction, PresenceChange, PresenceConfig, PresenceTracker, RealtimeEvent, RemoteStore,
    Result, SaveOutcome, SaveRequest,
};

/// Capability check consulted before every inbound operation. A denial
/// is a hard failure, raised before any optimistic state exists.
pub trait PermissionGate: Send + Sync {
    fn allows(&self, resource: &str, operation: &str) -> bool;
}

/// Grants everything. Useful for tests and single-user hosts.
pub struct AllowAll;

impl PermissionGate for AllowAll {
    fn allows(&self, _resource: &str, _operation: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveState {
    Idle,
    Saving,
    Saved,
    Conflict,
    Error,
}

impl SaveState {
    fn is_terminal(self) -> bool {
        matches!(self, SaveState::Saved | SaveState::Conflict | SaveState::Error)
    }
}

/// In-flight local edit awaiting the server's answer. A second edit to
/// the same key extends `new_value` but keeps the first edit's
/// `original_value` so a rollback lands on the pre-optimistic state.
#[derive(Debug, Clone)]
pub struct OptimisticUpdate {
    pub original_value: String,
    pub new_value: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub user_id: String,
    pub user_name: String,
    /// Terminal save states fall back to idle after this long.
    pub reset_after: Duration,
    /// Values treated as UI placeholder text; saving one is a no-op.
    pub placeholders: Vec<String>,
}

impl SessionConfig {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            reset_after: Duration::from_secs(3),
            placeholders: vec![
                "Enter text here...".to_string(),
                "Add your content".to_string(),
            ],
        }
    }
}

pub struct EditSession {
    config: SessionConfig,
    permissions: Arc<dyn PermissionGate>,
    remote: Arc<dyn RemoteStore>,
    router: Arc<Mutex<EventRouter>>,
    presence: Arc<Mutex<PresenceTracker>>,
    positions: PositionManager,
    content: HashMap<String, String>,
    versions: HashMap<String, String>,
    optimistic: HashMap<String, OptimisticUpdate>,
    conflicts: Vec<ConflictItem>,
    save_state: SaveState,
    state_changed_at: DateTime<Utc>,
    current_page: Option<String>,
}

impl EditSession {
    pub fn new(
        config: SessionConfig,
        permissions: Arc<dyn PermissionGate>,
        remote: Arc<dyn RemoteStore>,
        registry: ComponentRegistry,
    ) -> Self {
        let router = Arc::new(Mutex::new(EventRouter::new()));
        let positions = PositionManager::new(registry).with_router(router.clone());

        Self {
            config,
            permissions,
            remote,
            router,
            presence: Arc::new(Mutex::new(PresenceTracker::default())),
            positions,
            content: HashMap::new(),
            versions: HashMap::new(),
            optimistic: HashMap::new(),
            conflicts: Vec::new(),
            save_state: SaveState::Idle,
            state_changed_at: Utc::now(),
            current_page: None,
        }
    }

    pub fn with_presence_config(self, config: PresenceConfig) -> Self {
        *self.presence.lock() = PresenceTracker::new(config);
        self
    }

    pub fn router(&self) -> Arc<Mutex<EventRouter>> {
        self.router.clone()
    }

    pub fn presence_tracker(&self) -> Arc<Mutex<PresenceTracker>> {
        self.presence.clone()
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn positions_mut(&mut self) -> &mut PositionManager {
        &mut self.positions
    }

    /// Attach the outbound network sender.
    pub fn connect(&self, sender: mpsc::UnboundedSender<RealtimeEvent>) {
        self.router.lock().set_network(sender);
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.router.lock().connection_status()
    }

    pub fn subscribe_presence(&self) -> mpsc::UnboundedReceiver<PresenceChange> {
        self.presence.lock().subscribe()
    }

    pub fn conflicts(&self) -> &[ConflictItem] {
        &self.conflicts
    }

    pub fn presence(&self, page: &str) -> Vec<EditorPresence> {
        self.presence.lock().snapshot(page)
    }

    pub fn content(&self, page: &str, key: &str) -> Option<&String> {
        self.content.get(&content_key(page, key))
    }

    /// Seed the local content cache, e.g. from the initial page load.
    pub fn set_content(&mut self, page: &str, key: &str, value: impl Into<String>) {
        self.content.insert(content_key(page, key), value.into());
    }

    pub fn version(&self, page: &str, key: &str) -> &str {
        self.versions
            .get(&content_key(page, key))
            .map(String::as_str)
            .unwrap_or("0")
    }

    pub fn optimistic_update(&self, page: &str, key: &str) -> Option<&OptimisticUpdate> {
        self.optimistic.get(&content_key(page, key))
    }

    /// Save state with terminal states auto-resetting to idle.
    pub fn save_state(&self) -> SaveState {
        if self.save_state.is_terminal() {
            let age = (Utc::now() - self.state_changed_at).to_std().unwrap_or_default();
            if age >= self.config.reset_after {
                return SaveState::Idle;
            }
        }
        self.save_state
    }

    pub fn join_page(&mut self, page: &str) -> Result<()> {
        self.check("page", "collaborate")?;
        let presence =
            EditorPresence::new(self.config.user_id.clone(), self.config.user_name.clone());
        self.presence.lock().join(page, presence);
        self.current_page = Some(page.to_string());
        Ok(())
    }

    pub fn leave_page(&mut self, page: &str) -> Result<()> {
        self.check("page", "collaborate")?;
        self.presence.lock().leave(page, &self.config.user_id);
        if self.current_page.as_deref() == Some(page) {
            self.current_page = None;
        }
        Ok(())
    }

    pub fn update_presence(
        &mut self,
        page: &str,
        component_id: Option<ComponentId>,
        action: PresenceAction,
    ) -> Result<()> {
        self.check("page", "collaborate")?;
        self.presence
            .lock()
            .update(page, &self.config.user_id, component_id, Some(action));
        Ok(())
    }

    pub fn heartbeat(&mut self, page: &str) {
        self.presence.lock().heartbeat(page, &self.config.user_id);
    }

    /// Full save pipeline: stage the optimistic edit, persist it
    /// remotely, then commit or roll back on the answer.
    pub async fn save_content(
        &mut self,
        key: &str,
        value: &str,
        content_type: &str,
        page: &str,
    ) -> Result<()> {
        let Some(request) = self.stage_save(key, value, content_type, page)? else {
            return Ok(());
        };

        let remote = self.remote.clone();
        match remote.save_content(&request).await {
            Ok(outcome) => {
                self.complete_save(&request, outcome);
                Ok(())
            }
            Err(err) => {
                self.fail_save(&request);
                Err(err)
            }
        }
    }

    /// Record the optimistic edit and emit it locally. Returns the
    /// remote request to issue, or `None` for placeholder/empty values
    /// (a no-op save that succeeds without a round trip).
    pub fn stage_save(
        &mut self,
        key: &str,
        value: &str,
        content_type: &str,
        page: &str,
    ) -> Result<Option<SaveRequest>> {
        self.check("content", "write")?;

        if self.is_placeholder(value) {
            tracing::debug!(key, page, "placeholder value; skipping save");
            return Ok(None);
        }

        let content_key = content_key(page, key);
        let previous = self
            .content
            .get(&content_key)
            .cloned()
            .unwrap_or_default();

        match self.optimistic.get_mut(&content_key) {
            Some(record) => {
                record.new_value = value.to_string();
                record.timestamp = Utc::now();
            }
            None => {
                self.optimistic.insert(
                    content_key.clone(),
                    OptimisticUpdate {
                        original_value: previous.clone(),
                        new_value: value.to_string(),
                        timestamp: Utc::now(),
                    },
                );
            }
        }
        self.content.insert(content_key.clone(), value.to_string());
        self.transition(SaveState::Saving);

        let version = self.version_of(&content_key).to_string();
        self.route(RealtimeEvent::new(
            page,
            self.config.user_id.clone(),
            version.clone(),
            EventPayload::ContentChange {
                content_key,
                old_value: previous,
                new_value: value.to_string(),
                content_type: content_type.to_string(),
            },
        ));

        Ok(Some(SaveRequest {
            key: key.to_string(),
            value: value.to_string(),
            content_type: content_type.to_string(),
            page: page.to_string(),
            expected_version: version,
        }))
    }

    /// Reconcile the server's answer against the latest optimistic
    /// state for the request's content key.
    pub fn complete_save(&mut self, request: &SaveRequest, outcome: SaveOutcome) {
        let key = content_key(&request.page, &request.key);

        match outcome {
            SaveOutcome::Saved { version } => {
                if self.optimistic.remove(&key).is_none() {
                    tracing::debug!(content_key = %key, "save confirmed after reconciliation");
                }
                self.versions.insert(key, version);
                self.transition(SaveState::Saved);
            }
            SaveOutcome::Conflict {
                current_value,
                last_modified_by,
                message,
            } => {
                tracing::warn!(
                    content_key = %key,
                    by = %last_modified_by,
                    message = %message,
                    "save rejected with a version mismatch"
                );

                let attempted = self
                    .optimistic
                    .get(&key)
                    .map(|record| record.new_value.clone())
                    .unwrap_or_else(|| request.value.clone());
                let item =
                    ConflictItem::content(key, attempted, current_value, last_modified_by);
                let conflict_id = item.id;
                self.conflicts.push(item);

                let version = self.version_of(&content_key(&request.page, &request.key)).to_string();
                self.route(RealtimeEvent::new(
                    request.page.as_str(),
                    self.config.user_id.clone(),
                    version,
                    EventPayload::ConflictDetected {
                        conflict_id,
                        component_id: None,
                    },
                ));

                self.rollback(request);
                self.transition(SaveState::Conflict);
            }
        }
    }

    /// Transport-level failure: roll the optimistic edit back and
    /// surface the error state. Retry policy belongs to the transport.
    pub fn fail_save(&mut self, request: &SaveRequest) {
        self.rollback(request);
        self.transition(SaveState::Error);
    }

    /// Settle a conflict through the remote resolution endpoint; the
    /// strategy is the caller's choice, never the engine's.
    pub async fn resolve_conflict(
        &mut self,
        conflict_id: ConflictId,
        resolution: ConflictResolution,
    ) -> Result<()> {
        self.check("conflicts", "resolve")?;

        let index = self
            .conflicts
            .iter()
            .position(|c| c.id == conflict_id)
            .ok_or(CollaborationError::ConflictNotFound(conflict_id))?;
        let item = self.conflicts[index].clone();

        let remote = self.remote.clone();
        remote.resolve_conflict(&item, resolution).await?;

        if resolution == ConflictResolution::AcceptRemote && item.kind == ConflictKind::Content {
            self.content
                .insert(item.subject.clone(), item.remote_version.clone());
        }
        self.conflicts.remove(index);
        Ok(())
    }

    pub async fn add_component(
        &mut self,
        component_type: &str,
        position: Position,
        props: &Props,
    ) -> Result<ComponentId> {
        self.check("components", "write")?;

        let user_id = self.config.user_id.clone();
        let id = self
            .positions
            .insert_component(component_type, position, props, &user_id)?;

        let instance = self
            .positions
            .registry()
            .instance(id)
            .ok_or(PageError::NotFound(id))?
            .clone();
        let remote = self.remote.clone();
        if let Err(err) = remote.create_component(&instance).await {
            tracing::warn!(component = %id, error = %err, "remote create failed");
            return Err(err);
        }
        Ok(id)
    }

    pub async fn move_component(
        &mut self,
        id: ComponentId,
        position: Position,
    ) -> Result<MoveOutcome> {
        self.check("components", "write")?;

        let user_id = self.config.user_id.clone();
        let outcome = self.positions.move_component(id, position, &user_id)?;
        self.conflicts.extend(outcome.conflicts.iter().cloned());

        if outcome.applied {
            if let Some(instance) = self.positions.registry().instance(id).cloned() {
                let remote = self.remote.clone();
                if let Err(err) = remote.update_component(&instance).await {
                    tracing::warn!(component = %id, error = %err, "remote move failed");
                    return Err(err);
                }
            }
        }
        Ok(outcome)
    }

    pub async fn delete_component(&mut self, id: ComponentId) -> Result<Vec<ComponentId>> {
        self.check("components", "write")?;

        let user_id = self.config.user_id.clone();
        let removed = self.positions.remove_component(id, &user_id)?;

        let remote = self.remote.clone();
        if let Err(err) = remote.delete_component(id).await {
            tracing::warn!(component = %id, error = %err, "remote delete failed");
            return Err(err);
        }
        Ok(removed)
    }

    fn rollback(&mut self, request: &SaveRequest) {
        let key = content_key(&request.page, &request.key);
        let Some(record) = self.optimistic.remove(&key) else {
            return;
        };

        let abandoned = self.content.get(&key).cloned().unwrap_or_default();
        self.content.insert(key.clone(), record.original_value.clone());

        let version = self.version_of(&key).to_string();
        self.route(RealtimeEvent::new(
            request.page.as_str(),
            self.config.user_id.clone(),
            version,
            EventPayload::ContentChange {
                content_key: key,
                old_value: abandoned,
                new_value: record.original_value,
                content_type: request.content_type.clone(),
            },
        ));
    }

    fn is_placeholder(&self, value: &str) -> bool {
        let trimmed = value.trim();
        trimmed.is_empty() || self.config.placeholders.iter().any(|p| p == trimmed)
    }

    fn version_of(&self, content_key: &str) -> &str {
        self.versions
            .get(content_key)
            .map(String::as_str)
            .unwrap_or("0")
    }

    fn check(&self, resource: &str, operation: &str) -> Result<()> {
        if self.permissions.allows(resource, operation) {
            Ok(())
        } else {
            Err(CollaborationError::PermissionDenied(format!(
                "'{operation}' on '{resource}' refused for user {}",
                self.config.user_id
            )))
        }
    }

    fn transition(&mut self, state: SaveState) {
        tracing::debug!(from = ?self.save_state, to = ?state, "save state transition");
        self.save_state = state;
        self.state_changed_at = Utc::now();
    }

    fn route(&self, event: RealtimeEvent) {
        self.router.lock().route(event);
    }
}

fn content_key(page: &str, key: &str) -> String {
    format!("{page}:{key}")
}
