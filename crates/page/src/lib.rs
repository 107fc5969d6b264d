/// Page data model: positioned components arranged in sections and
/// parent/child hierarchies, plus the pure calculations over them.
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

mod component;
pub use component::*;

mod position;
pub use position::*;

mod registry;
pub use registry::*;

#[derive(Debug, Error)]
pub enum PageError {
    #[error("unknown component type: {0}")]
    UnknownType(String),
    #[error("component not found: {0}")]
    NotFound(ComponentId),
    #[error("invalid props: {0}")]
    InvalidProps(String),
    #[error("invalid position: {0}")]
    InvalidPosition(String),
}

pub type Result<T> = std::result::Result<T, PageError>;

/// Sanity bound on order values arriving from the wire.
pub const MAX_ORDER: u32 = 100_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ComponentId(pub Uuid);

impl ComponentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ComponentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Placement of a component on a page. Order values are unique within
/// the `(page_id, section_id, parent_id)` scope and contiguous from 0
/// after normalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Position {
    pub page_id: String,
    pub section_id: String,
    pub order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ComponentId>,
}

impl Position {
    pub fn new(page_id: impl Into<String>, section_id: impl Into<String>, order: u32) -> Self {
        Self {
            page_id: page_id.into(),
            section_id: section_id.into(),
            order,
            parent_id: None,
        }
    }

    pub fn with_parent(mut self, parent_id: ComponentId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Two positions share an ordering scope when page, section and
    /// parent all match.
    pub fn same_scope(&self, other: &Position) -> bool {
        self.page_id == other.page_id
            && self.section_id == other.section_id
            && self.parent_id == other.parent_id
    }
}
