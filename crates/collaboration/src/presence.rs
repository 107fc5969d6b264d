/// Live editor presence per page. Entries are refreshed by heartbeats
/// and activity, and reaped by a periodic sweep once their age exceeds
/// the configured timeout.
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use page::ComponentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceAction {
    Editing,
    Idle,
}

/// One connected editor on one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditorPresence {
    pub user_id: String,
    pub user_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub action: PresenceAction,
    pub component_id: Option<ComponentId>,
    pub last_seen: DateTime<Utc>,
}

impl EditorPresence {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            avatar: None,
            action: PresenceAction::Idle,
            component_id: None,
            last_seen: Utc::now(),
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }

    /// Refresh the last-seen timestamp.
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        let age = (Utc::now() - self.last_seen).to_std().unwrap_or_default();
        age > timeout
    }
}

/// Presence lifetime knobs. The timeout bounds entry lifetime
/// independently of how often clients heartbeat or the sweep runs.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub heartbeat: Duration,
    pub timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(30),
            timeout: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Notification sent to subscribers on every presence mutation. State
/// changes carry the full page snapshot so renderers never diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceChange {
    UserJoined { page: String, user_id: String },
    UserLeft { page: String, user_id: String },
    StateChanged { page: String, editors: Vec<EditorPresence> },
}

/// Per-page map of connected editors. State machine per (page, user):
/// absent -> present(idle) <-> present(editing) -> absent.
pub struct PresenceTracker {
    config: PresenceConfig,
    pages: HashMap<String, HashMap<String, EditorPresence>>,
    subscribers: Vec<mpsc::UnboundedSender<PresenceChange>>,
}

impl PresenceTracker {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            config,
            pages: HashMap::new(),
            subscribers: Vec::new(),
        }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<PresenceChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Add or overwrite an editor's entry on a page.
    pub fn join(&mut self, page: &str, presence: EditorPresence) {
        let user_id = presence.user_id.clone();
        self.pages
            .entry(page.to_string())
            .or_default()
            .insert(user_id.clone(), presence);

        self.notify(PresenceChange::UserJoined {
            page: page.to_string(),
            user_id,
        });
        self.notify_state(page);
    }

    /// Refresh an editor's last-seen timestamp.
    pub fn heartbeat(&mut self, page: &str, user_id: &str) {
        if let Some(presence) = self
            .pages
            .get_mut(page)
            .and_then(|editors| editors.get_mut(user_id))
        {
            presence.touch();
        }
    }

    /// Merge activity into an existing entry, refreshing its timestamp.
    pub fn update(
        &mut self,
        page: &str,
        user_id: &str,
        component_id: Option<ComponentId>,
        action: Option<PresenceAction>,
    ) {
        let Some(presence) = self
            .pages
            .get_mut(page)
            .and_then(|editors| editors.get_mut(user_id))
        else {
            return;
        };

        presence.component_id = component_id;
        if let Some(action) = action {
            presence.action = action;
        }
        presence.touch();

        self.notify_state(page);
    }

    /// Explicit removal, bypassing the timeout.
    pub fn leave(&mut self, page: &str, user_id: &str) {
        let removed = self
            .pages
            .get_mut(page)
            .map(|editors| editors.remove(user_id).is_some())
            .unwrap_or(false);

        if removed {
            self.notify(PresenceChange::UserLeft {
                page: page.to_string(),
                user_id: user_id.to_string(),
            });
            self.notify_state(page);
        }
    }

    /// Current editors on a page, sorted by user id.
    pub fn snapshot(&self, page: &str) -> Vec<EditorPresence> {
        let mut editors: Vec<EditorPresence> = self
            .pages
            .get(page)
            .map(|editors| editors.values().cloned().collect())
            .unwrap_or_default();
        editors.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        editors
    }

    /// Remove every entry whose last-seen age exceeds the timeout.
    /// Returns how many entries were reaped.
    pub fn sweep(&mut self) -> usize {
        let timeout = self.config.timeout;
        let mut departed: Vec<(String, String)> = Vec::new();

        for (page, editors) in &mut self.pages {
            editors.retain(|user_id, presence| {
                if presence.is_expired(timeout) {
                    departed.push((page.clone(), user_id.clone()));
                    false
                } else {
                    true
                }
            });
        }

        let mut touched_pages: Vec<String> = Vec::new();
        for (page, user_id) in &departed {
            tracing::debug!(page = %page, user_id = %user_id, "presence entry timed out");
            self.notify(PresenceChange::UserLeft {
                page: page.clone(),
                user_id: user_id.clone(),
            });
            if !touched_pages.contains(page) {
                touched_pages.push(page.clone());
            }
        }
        for page in touched_pages {
            self.notify_state(&page);
        }

        departed.len()
    }

    fn notify_state(&mut self, page: &str) {
        let editors = self.snapshot(page);
        self.notify(PresenceChange::StateChanged {
            page: page.to_string(),
            editors,
        });
    }

    fn notify(&mut self, change: PresenceChange) {
        self.subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(PresenceConfig::default())
    }
}

/// Run the cleanup sweep on the tracker's configured interval.
pub fn spawn_sweeper(tracker: Arc<Mutex<PresenceTracker>>) -> tokio::task::JoinHandle<()> {
    let sweep_interval = tracker.lock().config().sweep_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            tracker.lock().sweep();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(PresenceConfig::default())
    }

    #[test]
    fn join_defaults_to_idle() {
        let mut presence = tracker();
        presence.join("home", EditorPresence::new("u1", "Alice"));

        let editors = presence.snapshot("home");
        assert_eq!(editors.len(), 1);
        assert_eq!(editors[0].action, PresenceAction::Idle);
    }

    #[test]
    fn update_merges_activity_and_refreshes_last_seen() {
        let mut presence = tracker();
        presence.join("home", EditorPresence::new("u1", "Alice"));

        let component_id = ComponentId::new();
        presence.update("home", "u1", Some(component_id), Some(PresenceAction::Editing));

        let editors = presence.snapshot("home");
        assert_eq!(editors[0].action, PresenceAction::Editing);
        assert_eq!(editors[0].component_id, Some(component_id));
    }

    #[test]
    fn expired_entries_survive_until_the_sweep_runs() {
        let mut presence = tracker();
        presence.join("home", EditorPresence::new("u1", "Alice"));
        presence.join("home", EditorPresence::new("u2", "Bob"));

        // u1 last heartbeat 130s ago with a 120s timeout.
        presence
            .pages
            .get_mut("home")
            .unwrap()
            .get_mut("u1")
            .unwrap()
            .last_seen = Utc::now() - chrono::Duration::seconds(130);

        assert_eq!(presence.snapshot("home").len(), 2);

        let reaped = presence.sweep();
        assert_eq!(reaped, 1);

        let editors = presence.snapshot("home");
        assert_eq!(editors.len(), 1);
        assert_eq!(editors[0].user_id, "u2");
    }

    #[test]
    fn heartbeat_saves_an_entry_from_the_sweep() {
        let mut presence = tracker();
        presence.join("home", EditorPresence::new("u1", "Alice"));
        presence
            .pages
            .get_mut("home")
            .unwrap()
            .get_mut("u1")
            .unwrap()
            .last_seen = Utc::now() - chrono::Duration::seconds(130);

        presence.heartbeat("home", "u1");

        assert_eq!(presence.sweep(), 0);
        assert_eq!(presence.snapshot("home").len(), 1);
    }

    #[test]
    fn leave_bypasses_the_timeout() {
        let mut presence = tracker();
        presence.join("home", EditorPresence::new("u1", "Alice"));
        presence.leave("home", "u1");

        assert!(presence.snapshot("home").is_empty());
    }

    #[test]
    fn every_mutation_emits_a_full_snapshot() {
        let mut presence = tracker();
        let mut rx = presence.subscribe();

        presence.join("home", EditorPresence::new("u1", "Alice"));

        assert!(matches!(
            rx.try_recv().unwrap(),
            PresenceChange::UserJoined { .. }
        ));
        match rx.try_recv().unwrap() {
            PresenceChange::StateChanged { page, editors } => {
                assert_eq!(page, "home");
                assert_eq!(editors.len(), 1);
            }
            other => panic!("expected state change, got {other:?}"),
        }
    }

    #[test]
    fn sweep_notifies_departures() {
        let mut presence = tracker();
        presence.join("home", EditorPresence::new("u1", "Alice"));
        let mut rx = presence.subscribe();

        presence
            .pages
            .get_mut("home")
            .unwrap()
            .get_mut("u1")
            .unwrap()
            .last_seen = Utc::now() - chrono::Duration::seconds(500);
        presence.sweep();

        assert!(matches!(
            rx.try_recv().unwrap(),
            PresenceChange::UserLeft { .. }
        ));
    }
}
