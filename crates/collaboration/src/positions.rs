/// Position manager: turns position-change intents into atomic,
/// observable registry mutations, and arbitrates concurrent moves that
/// target the same slot.
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use page::{
    calculate_insert, calculate_move, calculate_remove, can_move_to_parent, descendants,
    normalize_positions, validate_position, ComponentId, ComponentRegistry, InstanceUpdate,
    PageError, Position, Props, ReorderOperation,
};

use crate::{
    CollaborationError, ConflictItem, EventPayload, EventRouter, RealtimeEvent, Result,
};

/// How long a slot registration lives before the deferred resolver
/// settles it.
pub const DEFAULT_MOVE_WINDOW: Duration = Duration::from_secs(1);

/// One ordering slot: the exact target of a move.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SlotKey {
    page_id: String,
    section_id: String,
    order: u32,
}

impl SlotKey {
    fn of(position: &Position) -> Self {
        Self {
            page_id: position.page_id.clone(),
            section_id: position.section_id.clone(),
            order: position.order,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingMove {
    component_id: ComponentId,
    user_id: String,
    position: Position,
    registered_at: DateTime<Utc>,
    /// Whether the move already ran; unapplied registrations are picked
    /// up by the deferred resolver.
    applied: bool,
}

/// Result of a move request. An unapplied move lost the slot to a
/// concurrent request and was re-registered for deferred resolution.
#[derive(Debug, Clone)]
pub struct MoveOutcome {
    pub applied: bool,
    pub conflicts: Vec<ConflictItem>,
}

pub struct PositionManager {
    registry: ComponentRegistry,
    pending: HashMap<SlotKey, PendingMove>,
    window: Duration,
    router: Option<Arc<Mutex<EventRouter>>>,
}

impl PositionManager {
    pub fn new(registry: ComponentRegistry) -> Self {
        Self {
            registry,
            pending: HashMap::new(),
            window: DEFAULT_MOVE_WINDOW,
            router: None,
        }
    }

    pub fn with_router(mut self, router: Arc<Mutex<EventRouter>>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ComponentRegistry {
        &mut self.registry
    }

    /// Move a component to a new position. Validates the target,
    /// refuses cycles, and consults the pending-move table: if another
    /// user's move is already registered for the exact slot, this
    /// request replaces the registration instead of applying and the
    /// deferred resolver settles the slot once the window elapses
    /// (last registrant wins).
    pub fn move_component(
        &mut self,
        id: ComponentId,
        new_position: Position,
        user_id: &str,
    ) -> Result<MoveOutcome> {
        self.check_target(&new_position)?;

        let old_position = self
            .registry
            .instance(id)
            .ok_or(PageError::NotFound(id))?
            .position
            .clone();

        {
            let snapshot = self.registry.instances_for_page(&new_position.page_id);
            let check = can_move_to_parent(id, new_position.parent_id, &snapshot);
            if !check.allowed {
                return Err(CollaborationError::InvalidMove(
                    check.reason.unwrap_or_else(|| "move rejected".to_string()),
                ));
            }
        }

        // Settle anything past its window before consulting the table.
        self.resolve_due_moves();

        let slot = SlotKey::of(&new_position);
        if let Some(existing) = self.pending.get(&slot) {
            if existing.user_id != user_id {
                let conflict = ConflictItem::structure(
                    id,
                    id.to_string(),
                    existing.component_id.to_string(),
                    existing.user_id.clone(),
                );
                tracing::warn!(
                    component = %id,
                    slot_order = new_position.order,
                    other_user = %existing.user_id,
                    "concurrent move targets an occupied slot; deferring"
                );

                self.pending.insert(
                    slot,
                    PendingMove {
                        component_id: id,
                        user_id: user_id.to_string(),
                        position: new_position.clone(),
                        registered_at: Utc::now(),
                        applied: false,
                    },
                );

                self.emit(RealtimeEvent::new(
                    new_position.page_id.clone(),
                    user_id,
                    "0",
                    EventPayload::ConflictDetected {
                        conflict_id: conflict.id,
                        component_id: Some(id),
                    },
                ));

                return Ok(MoveOutcome {
                    applied: false,
                    conflicts: vec![conflict],
                });
            }
        }

        self.apply_move(id, &old_position, &new_position, user_id)?;
        self.pending.insert(
            slot,
            PendingMove {
                component_id: id,
                user_id: user_id.to_string(),
                position: new_position,
                registered_at: Utc::now(),
                applied: true,
            },
        );

        Ok(MoveOutcome {
            applied: true,
            conflicts: Vec::new(),
        })
    }

    /// Settle pending-move registrations whose window has elapsed,
    /// applying whichever request is still registered for each slot.
    /// Returns how many deferred moves were applied.
    pub fn resolve_due_moves(&mut self) -> usize {
        let now = Utc::now();
        let window =
            chrono::Duration::from_std(self.window).unwrap_or_else(|_| chrono::Duration::seconds(1));

        let due: Vec<(SlotKey, PendingMove)> = self
            .pending
            .iter()
            .filter(|(_, entry)| now - entry.registered_at >= window)
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();

        let mut applied = 0;
        for (key, entry) in due {
            self.pending.remove(&key);
            if entry.applied {
                continue;
            }

            let Some(old_position) = self
                .registry
                .instance(entry.component_id)
                .map(|i| i.position.clone())
            else {
                tracing::warn!(
                    component = %entry.component_id,
                    "deferred move dropped; component no longer exists"
                );
                continue;
            };

            let allowed = {
                let snapshot = self.registry.instances_for_page(&entry.position.page_id);
                can_move_to_parent(entry.component_id, entry.position.parent_id, &snapshot).allowed
            };
            if !allowed {
                tracing::warn!(
                    component = %entry.component_id,
                    "deferred move dropped; it would create a cycle"
                );
                continue;
            }

            if self
                .apply_move(entry.component_id, &old_position, &entry.position, &entry.user_id)
                .is_ok()
            {
                applied += 1;
            }
        }

        applied
    }

    /// Create and place a new component, shifting the target scope to
    /// make room.
    pub fn insert_component(
        &mut self,
        component_type: &str,
        position: Position,
        props: &Props,
        user_id: &str,
    ) -> Result<ComponentId> {
        self.check_target(&position)?;

        let id = self.registry.create_instance(component_type, props, user_id)?;

        let calc = {
            let snapshot = self.registry.instances_for_page(&position.page_id);
            calculate_insert(&position, &snapshot)
        };
        self.registry.apply_reorder(&calc.operations, user_id)?;
        self.registry
            .update_instance(id, InstanceUpdate::position(position.clone()), user_id)?;

        let instance = self.registry.instance(id).ok_or(PageError::NotFound(id))?;
        let event = RealtimeEvent::new(
            position.page_id.clone(),
            user_id,
            instance.version.to_string(),
            EventPayload::ComponentAdd {
                component_id: id,
                component_type: component_type.to_string(),
                position,
                props: instance.props.clone(),
            },
        );
        self.emit(event);

        Ok(id)
    }

    /// Remove a component and every descendant discovered through the
    /// hierarchy, closing the gap left among its siblings.
    pub fn remove_component(&mut self, id: ComponentId, user_id: &str) -> Result<Vec<ComponentId>> {
        let instance = self.registry.instance(id).ok_or(PageError::NotFound(id))?;
        let position = instance.position.clone();
        let version = instance.version.to_string();

        let (children, calc) = {
            let snapshot = self.registry.instances_for_page(&position.page_id);
            (
                descendants(id, &snapshot),
                calculate_remove(id, &position, &snapshot),
            )
        };

        self.registry.delete_instance(id);
        for child in &children {
            self.registry.delete_instance(*child);
        }
        self.registry.apply_reorder(&calc.operations, user_id)?;

        let mut removed = vec![id];
        removed.extend(children);

        let event = RealtimeEvent::new(
            position.page_id.clone(),
            user_id,
            version,
            EventPayload::ComponentDelete {
                component_id: id,
                position,
                removed_components: removed.clone(),
                affected_components: calc.affected,
            },
        );
        self.emit(event);

        Ok(removed)
    }

    /// Reassign a whole scope to the given order. `ordered` must name
    /// exactly the active components of the scope.
    pub fn reorder_components(
        &mut self,
        page_id: &str,
        section_id: &str,
        parent_id: Option<ComponentId>,
        ordered: &[ComponentId],
        user_id: &str,
    ) -> Result<Vec<ReorderOperation>> {
        let current: Vec<ComponentId> = self
            .registry
            .instances_in_scope(page_id, section_id, parent_id)
            .iter()
            .map(|i| i.id)
            .collect();

        if current.len() != ordered.len() || !ordered.iter().all(|id| current.contains(id)) {
            return Err(CollaborationError::Validation(format!(
                "reorder must name exactly the {} components of section '{section_id}'",
                current.len()
            )));
        }

        let mut operations = Vec::new();
        for (index, id) in ordered.iter().enumerate() {
            let instance = self.registry.instance(*id).ok_or(PageError::NotFound(*id))?;
            if instance.position.order != index as u32 {
                operations.push(ReorderOperation {
                    component_id: *id,
                    from_order: instance.position.order,
                    to_order: index as u32,
                });
            }
        }
        self.registry.apply_reorder(&operations, user_id)?;

        let changed: Vec<ComponentId> = operations.iter().map(|op| op.component_id).collect();
        for op in &operations {
            let mut old_position = Position::new(page_id, section_id, op.from_order);
            old_position.parent_id = parent_id;
            let mut new_position = Position::new(page_id, section_id, op.to_order);
            new_position.parent_id = parent_id;

            let version = self
                .registry
                .instance(op.component_id)
                .map(|i| i.version.to_string())
                .unwrap_or_else(|| "0".to_string());
            let affected = changed
                .iter()
                .copied()
                .filter(|id| *id != op.component_id)
                .collect();

            self.emit(RealtimeEvent::new(
                page_id,
                user_id,
                version,
                EventPayload::ComponentMove {
                    component_id: op.component_id,
                    old_position,
                    new_position,
                    affected_components: affected,
                },
            ));
        }

        Ok(operations)
    }

    /// Opportunistically compact a scope's order values to 0..n-1.
    pub fn normalize_section(
        &mut self,
        page_id: &str,
        section_id: &str,
        parent_id: Option<ComponentId>,
        user_id: &str,
    ) -> Result<Vec<ReorderOperation>> {
        let operations = {
            let snapshot = self.registry.instances_for_page(page_id);
            normalize_positions(page_id, section_id, parent_id, &snapshot)
        };
        self.registry.apply_reorder(&operations, user_id)?;
        Ok(operations)
    }

    fn check_target(&self, position: &Position) -> Result<()> {
        let issues = validate_position(position);
        if !issues.is_empty() {
            let reasons: Vec<String> = issues.iter().map(|i| i.to_string()).collect();
            return Err(CollaborationError::Validation(reasons.join("; ")));
        }

        if let Some(parent) = position.parent_id {
            let valid = self
                .registry
                .instance(parent)
                .map(|p| p.is_active && p.position.page_id == position.page_id)
                .unwrap_or(false);
            if !valid {
                return Err(CollaborationError::Validation(format!(
                    "parent {parent} does not exist on page '{}'",
                    position.page_id
                )));
            }
        }

        Ok(())
    }

    fn apply_move(
        &mut self,
        id: ComponentId,
        old_position: &Position,
        new_position: &Position,
        user_id: &str,
    ) -> Result<Vec<ComponentId>> {
        let calc = {
            let mut snapshot = self.registry.instances_for_page(&new_position.page_id);
            if old_position.page_id != new_position.page_id {
                snapshot.extend(self.registry.instances_for_page(&old_position.page_id));
            }
            calculate_move(id, old_position, new_position, &snapshot)
        };

        self.registry.apply_reorder(&calc.operations, user_id)?;
        self.registry
            .update_instance(id, InstanceUpdate::position(new_position.clone()), user_id)?;

        let version = self
            .registry
            .instance(id)
            .map(|i| i.version.to_string())
            .unwrap_or_else(|| "0".to_string());
        let event = RealtimeEvent::new(
            new_position.page_id.clone(),
            user_id,
            version,
            EventPayload::ComponentMove {
                component_id: id,
                old_position: old_position.clone(),
                new_position: new_position.clone(),
                affected_components: calc.affected.clone(),
            },
        );
        self.emit(event);

        Ok(calc.affected)
    }

    /// Emission is best-effort: a routing failure never rolls back the
    /// already-applied local mutation.
    fn emit(&self, event: RealtimeEvent) {
        if let Some(router) = &self.router {
            router.lock().route(event);
        }
    }
}

/// Drive the deferred resolver on the move window interval.
pub fn spawn_move_resolver(
    manager: Arc<Mutex<PositionManager>>,
    window: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(window);
        interval.tick().await;
        loop {
            interval.tick().await;
            manager.lock().resolve_due_moves();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use page::{ComponentDefinition, PropKind, PropSchema};
    use serde_json::json;

    fn manager() -> PositionManager {
        let mut registry = ComponentRegistry::new();
        registry.register_definition(
            ComponentDefinition::new("text", "content")
                .with_prop("content", PropSchema::new(PropKind::String)),
        );
        PositionManager::new(registry)
    }

    fn props() -> Props {
        let mut props = Props::new();
        props.insert("content".into(), json!("hello"));
        props
    }

    fn orders_in(manager: &PositionManager, page: &str, section: &str) -> Vec<(ComponentId, u32)> {
        manager
            .registry()
            .instances_in_scope(page, section, None)
            .iter()
            .map(|i| (i.id, i.position.order))
            .collect()
    }

    #[test]
    fn insert_into_empty_section_lands_at_zero() {
        let mut manager = manager();
        let id = manager
            .insert_component("text", Position::new("page1", "main", 0), &props(), "alice")
            .unwrap();

        assert_eq!(orders_in(&manager, "page1", "main"), vec![(id, 0)]);
    }

    #[test]
    fn insert_in_the_middle_shifts_later_siblings() {
        let mut manager = manager();
        let a = manager
            .insert_component("text", Position::new("page1", "main", 0), &props(), "alice")
            .unwrap();
        let b = manager
            .insert_component("text", Position::new("page1", "main", 1), &props(), "alice")
            .unwrap();
        let c = manager
            .insert_component("text", Position::new("page1", "main", 2), &props(), "alice")
            .unwrap();
        let d = manager
            .insert_component("text", Position::new("page1", "main", 1), &props(), "alice")
            .unwrap();

        assert_eq!(
            orders_in(&manager, "page1", "main"),
            vec![(a, 0), (d, 1), (b, 2), (c, 3)]
        );
    }

    #[test]
    fn move_within_a_section_reorders_siblings() {
        let mut manager = manager();
        let a = manager
            .insert_component("text", Position::new("page1", "main", 0), &props(), "alice")
            .unwrap();
        let b = manager
            .insert_component("text", Position::new("page1", "main", 1), &props(), "alice")
            .unwrap();
        let c = manager
            .insert_component("text", Position::new("page1", "main", 2), &props(), "alice")
            .unwrap();

        let outcome = manager
            .move_component(a, Position::new("page1", "main", 2), "alice")
            .unwrap();
        assert!(outcome.applied);

        assert_eq!(
            orders_in(&manager, "page1", "main"),
            vec![(b, 0), (c, 1), (a, 2)]
        );
    }

    #[test]
    fn remove_deletes_descendants_and_closes_the_gap() {
        let mut manager = manager();
        let a = manager
            .insert_component("text", Position::new("page1", "main", 0), &props(), "alice")
            .unwrap();
        let b = manager
            .insert_component("text", Position::new("page1", "main", 1), &props(), "alice")
            .unwrap();
        let child = manager
            .insert_component(
                "text",
                Position::new("page1", "main", 0).with_parent(a),
                &props(),
                "alice",
            )
            .unwrap();

        let removed = manager.remove_component(a, "alice").unwrap();

        assert_eq!(removed, vec![a, child]);
        assert!(manager.registry().instance(child).is_none());
        assert_eq!(orders_in(&manager, "page1", "main"), vec![(b, 0)]);
    }

    #[test]
    fn concurrent_move_to_the_same_slot_defers_the_second_request() {
        let mut manager = manager();
        let a = manager
            .insert_component("text", Position::new("page1", "main", 0), &props(), "alice")
            .unwrap();
        let b = manager
            .insert_component("text", Position::new("page1", "main", 1), &props(), "alice")
            .unwrap();
        let c = manager
            .insert_component("text", Position::new("page1", "main", 2), &props(), "alice")
            .unwrap();

        let first = manager
            .move_component(a, Position::new("page1", "main", 2), "alice")
            .unwrap();
        assert!(first.applied);

        let second = manager
            .move_component(b, Position::new("page1", "main", 2), "bob")
            .unwrap();
        assert!(!second.applied);
        assert_eq!(second.conflicts.len(), 1);
        assert_eq!(second.conflicts[0].conflicted_by, "alice");

        // B has not moved yet.
        let b_order = manager.registry().instance(b).unwrap().position.order;
        assert_ne!(b_order, 2);
        let _ = c;
    }

    #[test]
    fn deferred_resolver_applies_the_surviving_registration() {
        let mut manager = manager();
        let a = manager
            .insert_component("text", Position::new("page1", "main", 0), &props(), "alice")
            .unwrap();
        let b = manager
            .insert_component("text", Position::new("page1", "main", 1), &props(), "alice")
            .unwrap();

        manager
            .move_component(a, Position::new("page1", "main", 1), "alice")
            .unwrap();
        let outcome = manager
            .move_component(b, Position::new("page1", "main", 1), "bob")
            .unwrap();
        assert!(!outcome.applied);

        // Age every registration past the window, then settle.
        let past = Utc::now() - chrono::Duration::seconds(2);
        for entry in manager.pending.values_mut() {
            entry.registered_at = past;
        }
        let applied = manager.resolve_due_moves();

        assert_eq!(applied, 1);
        assert!(manager.pending.is_empty());
        assert_eq!(manager.registry().instance(b).unwrap().position.order, 1);
    }

    #[test]
    fn cycle_moves_are_refused() {
        let mut manager = manager();
        let a = manager
            .insert_component("text", Position::new("page1", "main", 0), &props(), "alice")
            .unwrap();
        let child = manager
            .insert_component(
                "text",
                Position::new("page1", "main", 0).with_parent(a),
                &props(),
                "alice",
            )
            .unwrap();

        let result = manager.move_component(
            a,
            Position::new("page1", "main", 0).with_parent(child),
            "alice",
        );
        assert!(matches!(result, Err(CollaborationError::InvalidMove(_))));
    }

    #[test]
    fn unknown_parent_is_a_validation_error() {
        let mut manager = manager();
        let a = manager
            .insert_component("text", Position::new("page1", "main", 0), &props(), "alice")
            .unwrap();

        let result = manager.move_component(
            a,
            Position::new("page1", "main", 0).with_parent(ComponentId::new()),
            "alice",
        );
        assert!(matches!(result, Err(CollaborationError::Validation(_))));
    }

    #[test]
    fn reorder_reassigns_the_whole_scope() {
        let mut manager = manager();
        let a = manager
            .insert_component("text", Position::new("page1", "main", 0), &props(), "alice")
            .unwrap();
        let b = manager
            .insert_component("text", Position::new("page1", "main", 1), &props(), "alice")
            .unwrap();
        let c = manager
            .insert_component("text", Position::new("page1", "main", 2), &props(), "alice")
            .unwrap();

        manager
            .reorder_components("page1", "main", None, &[c, a, b], "alice")
            .unwrap();

        assert_eq!(
            orders_in(&manager, "page1", "main"),
            vec![(c, 0), (a, 1), (b, 2)]
        );
    }

    #[test]
    fn order_uniqueness_holds_after_mixed_operations() {
        let mut manager = manager();
        let mut ids = Vec::new();
        for order in 0..5 {
            ids.push(
                manager
                    .insert_component(
                        "text",
                        Position::new("page1", "main", order),
                        &props(),
                        "alice",
                    )
                    .unwrap(),
            );
        }

        manager
            .move_component(ids[0], Position::new("page1", "main", 3), "alice")
            .unwrap();
        manager.remove_component(ids[4], "alice").unwrap();
        manager
            .insert_component("text", Position::new("page1", "main", 1), &props(), "alice")
            .unwrap();
        manager.normalize_section("page1", "main", None, "alice").unwrap();

        let orders: Vec<u32> = manager
            .registry()
            .instances_in_scope("page1", "main", None)
            .iter()
            .map(|i| i.position.order)
            .collect();
        assert_eq!(orders, vec![0, 1, 2, 3, 4]);
    }
}
