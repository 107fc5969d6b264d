/// Pure position calculations: insert/move/remove shifts, hierarchy
/// construction and cycle prevention. No I/O; callers pass a read-only
/// snapshot of the registry and apply the returned operations.
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::{ComponentId, ComponentInstance, Position, MAX_ORDER};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PositionIssue {
    #[error("page id must not be empty")]
    EmptyPageId,
    #[error("section id must not be empty")]
    EmptySectionId,
    #[error("order {order} exceeds the maximum of {max}")]
    OrderOutOfRange { order: u32, max: u32 },
}

/// Validate a position without touching any state. An empty result
/// means the position is acceptable.
pub fn validate_position(position: &Position) -> Vec<PositionIssue> {
    let mut issues = Vec::new();

    if position.page_id.trim().is_empty() {
        issues.push(PositionIssue::EmptyPageId);
    }
    if position.section_id.trim().is_empty() {
        issues.push(PositionIssue::EmptySectionId);
    }
    if position.order > MAX_ORDER {
        issues.push(PositionIssue::OrderOutOfRange {
            order: position.order,
            max: MAX_ORDER,
        });
    }

    issues
}

/// A single order reassignment to apply through the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReorderOperation {
    pub component_id: ComponentId,
    pub from_order: u32,
    pub to_order: u32,
}

/// Result of an insert/move/remove calculation: the order the subject
/// component ends up at, plus the sibling shifts that make room for it.
#[derive(Debug, Clone, Default)]
pub struct PositionCalculation {
    pub new_order: u32,
    pub affected: Vec<ComponentId>,
    pub operations: Vec<ReorderOperation>,
}

/// Components in the target scope at or after the insertion point each
/// shift up by one. O(n) in the scope size.
pub fn calculate_insert(
    target: &Position,
    existing: &[&ComponentInstance],
) -> PositionCalculation {
    let mut calc = PositionCalculation {
        new_order: target.order,
        ..Default::default()
    };

    for item in existing {
        if item.position.same_scope(target) && item.position.order >= target.order {
            calc.affected.push(item.id);
            calc.operations.push(ReorderOperation {
                component_id: item.id,
                from_order: item.position.order,
                to_order: item.position.order + 1,
            });
        }
    }

    calc
}

/// A move within one scope is a reorder: components strictly between the
/// old and new order shift toward the vacated slot. A move across scopes
/// is a remove from the old scope followed by an insert into the new one.
pub fn calculate_move(
    component_id: ComponentId,
    old_position: &Position,
    new_position: &Position,
    existing: &[&ComponentInstance],
) -> PositionCalculation {
    let mut calc = PositionCalculation {
        new_order: new_position.order,
        ..Default::default()
    };

    if old_position.same_scope(new_position) {
        let old_order = old_position.order;
        let new_order = new_position.order;
        if old_order == new_order {
            return calc;
        }

        for item in existing {
            if item.id == component_id || !item.position.same_scope(old_position) {
                continue;
            }
            let order = item.position.order;
            let shifted = if new_order > old_order && order > old_order && order <= new_order {
                Some(order - 1)
            } else if new_order < old_order && order >= new_order && order < old_order {
                Some(order + 1)
            } else {
                None
            };
            if let Some(to_order) = shifted {
                calc.affected.push(item.id);
                calc.operations.push(ReorderOperation {
                    component_id: item.id,
                    from_order: order,
                    to_order,
                });
            }
        }

        return calc;
    }

    for item in existing {
        if item.id == component_id {
            continue;
        }
        if item.position.same_scope(old_position) && item.position.order > old_position.order {
            calc.affected.push(item.id);
            calc.operations.push(ReorderOperation {
                component_id: item.id,
                from_order: item.position.order,
                to_order: item.position.order - 1,
            });
        } else if item.position.same_scope(new_position)
            && item.position.order >= new_position.order
        {
            calc.affected.push(item.id);
            calc.operations.push(ReorderOperation {
                component_id: item.id,
                from_order: item.position.order,
                to_order: item.position.order + 1,
            });
        }
    }

    calc
}

/// Trailing components in the removed component's scope shift down to
/// close the gap.
pub fn calculate_remove(
    component_id: ComponentId,
    position: &Position,
    existing: &[&ComponentInstance],
) -> PositionCalculation {
    let mut calc = PositionCalculation::default();

    for item in existing {
        if item.id == component_id {
            continue;
        }
        if item.position.same_scope(position) && item.position.order > position.order {
            calc.affected.push(item.id);
            calc.operations.push(ReorderOperation {
                component_id: item.id,
                from_order: item.position.order,
                to_order: item.position.order - 1,
            });
        }
    }

    calc
}

/// Node in the parent/child forest of a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchyNode {
    pub id: ComponentId,
    pub order: u32,
    pub depth: u32,
    pub children: Vec<HierarchyNode>,
}

/// Build the page forest from `parent_id` links. A component whose
/// parent does not exist on the page is treated as a root, not dropped.
/// Children are sorted by order; depth is parent depth + 1.
pub fn build_hierarchy(page_id: &str, existing: &[&ComponentInstance]) -> Vec<HierarchyNode> {
    let on_page: Vec<&ComponentInstance> = existing
        .iter()
        .copied()
        .filter(|i| i.position.page_id == page_id)
        .collect();
    let known: HashSet<ComponentId> = on_page.iter().map(|i| i.id).collect();

    let mut children_of: HashMap<ComponentId, Vec<&ComponentInstance>> = HashMap::new();
    let mut roots: Vec<&ComponentInstance> = Vec::new();

    for &item in &on_page {
        match item.position.parent_id {
            Some(parent) if known.contains(&parent) => {
                children_of.entry(parent).or_default().push(item);
            }
            _ => roots.push(item),
        }
    }

    roots.sort_by_key(|i| i.position.order);
    roots
        .into_iter()
        .map(|root| build_node(root, 0, &children_of))
        .collect()
}

fn build_node(
    item: &ComponentInstance,
    depth: u32,
    children_of: &HashMap<ComponentId, Vec<&ComponentInstance>>,
) -> HierarchyNode {
    let mut children: Vec<&ComponentInstance> =
        children_of.get(&item.id).cloned().unwrap_or_default();
    children.sort_by_key(|c| c.position.order);

    HierarchyNode {
        id: item.id,
        order: item.position.order,
        depth,
        children: children
            .into_iter()
            .map(|child| build_node(child, depth + 1, children_of))
            .collect(),
    }
}

/// All transitive children of a component, in breadth-first order.
pub fn descendants(component_id: ComponentId, existing: &[&ComponentInstance]) -> Vec<ComponentId> {
    let mut children_of: HashMap<ComponentId, Vec<ComponentId>> = HashMap::new();
    for item in existing {
        if let Some(parent) = item.position.parent_id {
            children_of.entry(parent).or_default().push(item.id);
        }
    }

    let mut found = Vec::new();
    let mut queue = vec![component_id];
    let mut seen = HashSet::new();
    while let Some(current) = queue.pop() {
        if let Some(children) = children_of.get(&current) {
            for child in children {
                if seen.insert(*child) {
                    found.push(*child);
                    queue.push(*child);
                }
            }
        }
    }

    found
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveCheck {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl MoveCheck {
    fn ok() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Cycle prevention: a component may not become a child of itself or of
/// any of its descendants. This check runs before every reparenting move.
pub fn can_move_to_parent(
    component_id: ComponentId,
    new_parent_id: Option<ComponentId>,
    existing: &[&ComponentInstance],
) -> MoveCheck {
    let Some(parent) = new_parent_id else {
        return MoveCheck::ok();
    };

    if parent == component_id {
        return MoveCheck::rejected(format!("component {component_id} cannot be its own parent"));
    }

    if descendants(component_id, existing).contains(&parent) {
        return MoveCheck::rejected(format!(
            "component {parent} is a descendant of {component_id}; the move would create a cycle"
        ));
    }

    MoveCheck::ok()
}

/// Reassign a scope's orders to 0..n-1 based on the current ordering,
/// returning only the operations that actually change an order. Running
/// it twice yields no operations the second time.
pub fn normalize_positions(
    page_id: &str,
    section_id: &str,
    parent_id: Option<ComponentId>,
    existing: &[&ComponentInstance],
) -> Vec<ReorderOperation> {
    let scope = Position {
        page_id: page_id.to_string(),
        section_id: section_id.to_string(),
        order: 0,
        parent_id,
    };

    let mut in_scope: Vec<&ComponentInstance> = existing
        .iter()
        .copied()
        .filter(|i| i.position.same_scope(&scope))
        .collect();
    in_scope.sort_by_key(|i| i.position.order);

    in_scope
        .iter()
        .enumerate()
        .filter(|(index, item)| item.position.order != *index as u32)
        .map(|(index, item)| ReorderOperation {
            component_id: item.id,
            from_order: item.position.order,
            to_order: index as u32,
        })
        .collect()
}
