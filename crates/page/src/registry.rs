/// In-memory store of component definitions and instances. The registry
/// is a dumb store: tree semantics (descendant cleanup, gap closing)
/// live with its callers.
use chrono::Utc;
use std::collections::HashMap;

use crate::{
    validate_props, ComponentDefinition, ComponentId, ComponentInstance, PageError, Position,
    Props, ReorderOperation, Result,
};

/// Partial update applied to an instance. Absent fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct InstanceUpdate {
    pub position: Option<Position>,
    pub props: Option<Props>,
    pub is_active: Option<bool>,
}

impl InstanceUpdate {
    pub fn position(position: Position) -> Self {
        Self {
            position: Some(position),
            ..Default::default()
        }
    }

    pub fn props(props: Props) -> Self {
        Self {
            props: Some(props),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct ComponentRegistry {
    definitions: HashMap<String, ComponentDefinition>,
    instances: HashMap<ComponentId, ComponentInstance>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_definition(&mut self, definition: ComponentDefinition) {
        self.definitions
            .insert(definition.component_type.clone(), definition);
    }

    pub fn definition(&self, component_type: &str) -> Option<&ComponentDefinition> {
        self.definitions.get(component_type)
    }

    /// Create an instance of a registered type. Provided props are
    /// validated and overlaid on the definition's defaults. The new
    /// instance carries an empty position; the caller must place it.
    pub fn create_instance(
        &mut self,
        component_type: &str,
        props: &Props,
        user_id: &str,
    ) -> Result<ComponentId> {
        let definition = self
            .definitions
            .get(component_type)
            .ok_or_else(|| PageError::UnknownType(component_type.to_string()))?;

        let report = validate_props(definition, props);
        if !report.is_valid() {
            return Err(PageError::InvalidProps(report.errors.join("; ")));
        }

        let mut merged = definition.default_props.clone();
        for (key, value) in report.sanitized {
            merged.insert(key, value);
        }

        let now = Utc::now();
        let id = ComponentId::new();
        self.instances.insert(
            id,
            ComponentInstance {
                id,
                component_type: component_type.to_string(),
                position: Position::new("", "", 0),
                props: merged,
                version: 1,
                created_by: user_id.to_string(),
                created_at: now,
                last_modified_by: user_id.to_string(),
                last_modified_at: now,
                is_active: true,
            },
        );

        Ok(id)
    }

    pub fn instance(&self, id: ComponentId) -> Option<&ComponentInstance> {
        self.instances.get(&id)
    }

    /// Apply a partial update. Props in the update are re-validated
    /// against the definition and merged into the existing props. Every
    /// update stamps `last_modified_by`/`last_modified_at` and bumps the
    /// instance version.
    pub fn update_instance(
        &mut self,
        id: ComponentId,
        update: InstanceUpdate,
        user_id: &str,
    ) -> Result<()> {
        let instance = self
            .instances
            .get(&id)
            .ok_or(PageError::NotFound(id))?;

        let sanitized_props = match &update.props {
            Some(props) => {
                let definition = self
                    .definitions
                    .get(&instance.component_type)
                    .ok_or_else(|| PageError::UnknownType(instance.component_type.clone()))?;
                let report = validate_props(definition, props);
                if !report.is_valid() {
                    return Err(PageError::InvalidProps(report.errors.join("; ")));
                }
                Some(report.sanitized)
            }
            None => None,
        };

        let instance = self
            .instances
            .get_mut(&id)
            .ok_or(PageError::NotFound(id))?;

        if let Some(position) = update.position {
            instance.position = position;
        }
        if let Some(props) = sanitized_props {
            for (key, value) in props {
                instance.props.insert(key, value);
            }
        }
        if let Some(is_active) = update.is_active {
            instance.is_active = is_active;
        }

        instance.version += 1;
        instance.last_modified_by = user_id.to_string();
        instance.last_modified_at = Utc::now();

        Ok(())
    }

    /// Apply order reassignments produced by the position calculator.
    pub fn apply_reorder(&mut self, operations: &[ReorderOperation], user_id: &str) -> Result<()> {
        for op in operations {
            let instance = self
                .instances
                .get_mut(&op.component_id)
                .ok_or(PageError::NotFound(op.component_id))?;
            instance.position.order = op.to_order;
            instance.version += 1;
            instance.last_modified_by = user_id.to_string();
            instance.last_modified_at = Utc::now();
        }
        Ok(())
    }

    /// Hard removal. Returns whether an entry existed. Children are the
    /// caller's responsibility.
    pub fn delete_instance(&mut self, id: ComponentId) -> bool {
        self.instances.remove(&id).is_some()
    }

    /// Soft delete: the instance stays stored but drops out of
    /// positioning queries.
    pub fn deactivate_instance(&mut self, id: ComponentId, user_id: &str) -> Result<()> {
        self.update_instance(
            id,
            InstanceUpdate {
                is_active: Some(false),
                ..Default::default()
            },
            user_id,
        )
    }

    /// Active instances of a page, sorted by section and order. The
    /// canonical read path for position calculations.
    pub fn instances_for_page(&self, page_id: &str) -> Vec<&ComponentInstance> {
        let mut items: Vec<&ComponentInstance> = self
            .instances
            .values()
            .filter(|i| i.is_active && i.position.page_id == page_id)
            .collect();
        items.sort_by(|a, b| {
            (&a.position.section_id, a.position.order)
                .cmp(&(&b.position.section_id, b.position.order))
        });
        items
    }

    /// Active instances of one ordering scope, sorted by order.
    pub fn instances_in_scope(
        &self,
        page_id: &str,
        section_id: &str,
        parent_id: Option<ComponentId>,
    ) -> Vec<&ComponentInstance> {
        let scope = Position {
            page_id: page_id.to_string(),
            section_id: section_id.to_string(),
            order: 0,
            parent_id,
        };
        let mut items: Vec<&ComponentInstance> = self
            .instances
            .values()
            .filter(|i| i.is_active && i.position.same_scope(&scope))
            .collect();
        items.sort_by_key(|i| i.position.order);
        items
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PropKind, PropSchema};
    use serde_json::json;

    fn registry_with_text() -> ComponentRegistry {
        let mut registry = ComponentRegistry::new();
        registry.register_definition(
            ComponentDefinition::new("text", "content")
                .with_default("content", json!("Enter text here..."))
                .with_prop("content", PropSchema::new(PropKind::String))
                .with_prop("size", PropSchema::new(PropKind::Number)),
        );
        registry
    }

    #[test]
    fn create_fails_for_unknown_type() {
        let mut registry = ComponentRegistry::new();
        let result = registry.create_instance("missing", &Props::new(), "alice");
        assert!(matches!(result, Err(PageError::UnknownType(_))));
    }

    #[test]
    fn create_merges_defaults_under_props() {
        let mut registry = registry_with_text();
        let mut props = Props::new();
        props.insert("size".into(), json!(14));

        let id = registry.create_instance("text", &props, "alice").unwrap();
        let instance = registry.instance(id).unwrap();

        assert_eq!(instance.props["content"], json!("Enter text here..."));
        assert_eq!(instance.props["size"], json!(14));
        assert_eq!(instance.created_by, "alice");
        assert_eq!(instance.position.page_id, "");
    }

    #[test]
    fn update_stamps_modifier_and_bumps_version() {
        let mut registry = registry_with_text();
        let id = registry.create_instance("text", &Props::new(), "alice").unwrap();

        registry
            .update_instance(
                id,
                InstanceUpdate::position(Position::new("page1", "main", 0)),
                "bob",
            )
            .unwrap();

        let instance = registry.instance(id).unwrap();
        assert_eq!(instance.version, 2);
        assert_eq!(instance.last_modified_by, "bob");
        assert_eq!(instance.created_by, "alice");
    }

    #[test]
    fn update_revalidates_props() {
        let mut registry = registry_with_text();
        let id = registry.create_instance("text", &Props::new(), "alice").unwrap();

        let mut bad = Props::new();
        bad.insert("size".into(), json!("not a number"));
        let result = registry.update_instance(id, InstanceUpdate::props(bad), "alice");
        assert!(matches!(result, Err(PageError::InvalidProps(_))));

        // Failed update leaves the instance untouched.
        assert_eq!(registry.instance(id).unwrap().version, 1);
    }

    #[test]
    fn delete_reports_whether_an_entry_existed() {
        let mut registry = registry_with_text();
        let id = registry.create_instance("text", &Props::new(), "alice").unwrap();

        assert!(registry.delete_instance(id));
        assert!(!registry.delete_instance(id));
    }

    #[test]
    fn deactivated_instances_drop_out_of_page_reads() {
        let mut registry = registry_with_text();
        let id = registry.create_instance("text", &Props::new(), "alice").unwrap();
        registry
            .update_instance(
                id,
                InstanceUpdate::position(Position::new("page1", "main", 0)),
                "alice",
            )
            .unwrap();

        assert_eq!(registry.instances_for_page("page1").len(), 1);

        registry.deactivate_instance(id, "alice").unwrap();
        assert!(registry.instances_for_page("page1").is_empty());
        assert!(registry.instance(id).is_some());
    }

    #[test]
    fn page_reads_are_sorted_by_order() {
        let mut registry = registry_with_text();
        for order in [2u32, 0, 1] {
            let id = registry.create_instance("text", &Props::new(), "alice").unwrap();
            registry
                .update_instance(
                    id,
                    InstanceUpdate::position(Position::new("page1", "main", order)),
                    "alice",
                )
                .unwrap();
        }

        let orders: Vec<u32> = registry
            .instances_for_page("page1")
            .iter()
            .map(|i| i.position.order)
            .collect();
        assert_eq!(orders, vec![0, 1, 2]);
    }
}
