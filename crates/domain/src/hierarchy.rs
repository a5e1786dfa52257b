use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::status::Status;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Category,
    Course,
    Chapter,
    Lesson,
}

/// Static description of one level of the content tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HierarchyNode {
    pub kind: EntityKind,
    pub parent_relation: Option<&'static str>,
    pub children_relation: Option<&'static str>,
    pub child: Option<EntityKind>,
    pub order: u8,
}

pub const HIERARCHY: [HierarchyNode; 4] = [
    HierarchyNode {
        kind: EntityKind::Category,
        parent_relation: None,
        children_relation: Some("courses"),
        child: Some(EntityKind::Course),
        order: 1,
    },
    HierarchyNode {
        kind: EntityKind::Course,
        parent_relation: Some("category"),
        children_relation: Some("chapters"),
        child: Some(EntityKind::Chapter),
        order: 2,
    },
    HierarchyNode {
        kind: EntityKind::Chapter,
        parent_relation: Some("course"),
        children_relation: Some("lessons"),
        child: Some(EntityKind::Lesson),
        order: 3,
    },
    HierarchyNode {
        kind: EntityKind::Lesson,
        parent_relation: Some("chapter"),
        children_relation: None,
        child: None,
        order: 4,
    },
];

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Category,
        EntityKind::Course,
        EntityKind::Chapter,
        EntityKind::Lesson,
    ];

    pub fn node(&self) -> &'static HierarchyNode {
        match self {
            Self::Category => &HIERARCHY[0],
            Self::Course => &HIERARCHY[1],
            Self::Chapter => &HIERARCHY[2],
            Self::Lesson => &HIERARCHY[3],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Course => "course",
            Self::Chapter => "chapter",
            Self::Lesson => "lesson",
        }
    }

    /// Capitalized name used in user facing messages.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Category => "Category",
            Self::Course => "Course",
            Self::Chapter => "Chapter",
            Self::Lesson => "Lesson",
        }
    }

    pub fn order(&self) -> u8 {
        self.node().order
    }

    pub fn child(&self) -> Option<EntityKind> {
        self.node().child
    }

    pub fn parent(&self) -> Option<EntityKind> {
        match self {
            Self::Category => None,
            Self::Course => Some(Self::Category),
            Self::Chapter => Some(Self::Course),
            Self::Lesson => Some(Self::Chapter),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.child().is_none()
    }

    /// Number of descendant levels below this kind.
    pub fn max_cascade_levels(&self) -> u32 {
        self.descendants().len() as u32
    }

    /// Descendant kinds, nearest first.
    pub fn descendants(&self) -> Vec<EntityKind> {
        let mut out = Vec::new();
        let mut current = self.child();
        while let Some(kind) = current {
            out.push(kind);
            current = kind.child();
        }
        out
    }

    pub fn parse(value: &str) -> Option<Self> {
        value.parse().ok()
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "category" => Ok(Self::Category),
            "course" => Ok(Self::Course),
            "chapter" => Ok(Self::Chapter),
            "lesson" => Ok(Self::Lesson),
            _ => Err("unknown entity type"),
        }
    }
}

/// A persisted hierarchy node as seen by the cascade.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityRecord {
    pub kind: EntityKind,
    pub id: String,
    pub status: Status,
    pub parent_id: Option<String>,
}

impl EntityRecord {
    pub fn new(kind: EntityKind, id: impl Into<String>, status: Status) -> Self {
        Self {
            kind,
            id: id.into(),
            status,
            parent_id: None,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

/// An entity loaded together with its direct children and its parent's status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityWithChildren {
    pub entity: EntityRecord,
    pub parent_status: Option<Status>,
    pub children: Vec<EntityRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_strictly_increases_along_chain() {
        let mut current = Some(EntityKind::Category);
        let mut last = 0;
        while let Some(kind) = current {
            assert!(kind.order() > last);
            last = kind.order();
            current = kind.child();
        }
        assert_eq!(last, 4);
    }

    #[test]
    fn cascade_depth_matches_descendants() {
        assert_eq!(EntityKind::Category.max_cascade_levels(), 3);
        assert_eq!(EntityKind::Course.max_cascade_levels(), 2);
        assert_eq!(EntityKind::Chapter.max_cascade_levels(), 1);
        assert_eq!(EntityKind::Lesson.max_cascade_levels(), 0);
        assert!(EntityKind::Lesson.is_leaf());
    }

    #[test]
    fn parent_is_inverse_of_child() {
        for kind in EntityKind::ALL {
            if let Some(child) = kind.child() {
                assert_eq!(child.parent(), Some(kind));
            }
        }
    }

    #[test]
    fn registry_relations_line_up() {
        for node in HIERARCHY {
            assert_eq!(node.children_relation.is_some(), node.child.is_some());
            assert_eq!(node.parent_relation.is_some(), node.kind.parent().is_some());
        }
        assert_eq!(EntityKind::parse("Chapter"), Some(EntityKind::Chapter));
        assert_eq!(EntityKind::parse("unit"), None);
    }
}
