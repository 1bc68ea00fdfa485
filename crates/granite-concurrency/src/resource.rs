//! Hierarchical resource names.
//!
//! A resource is identified by its full path from the database root, e.g.
//! `database/partition.2/page.8589934592`. Equality is by full path; the
//! lock context layer guarantees two distinct contexts never alias one
//! name.

use std::fmt;
use std::sync::Arc;

/// One level of a resource path: a human-readable label plus a numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceLevel {
    pub label: Arc<str>,
    pub id: u64,
}

/// A non-empty path of `(label, id)` pairs from the database root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceName {
    path: Vec<ResourceLevel>,
}

impl ResourceName {
    /// A root-level resource.
    #[must_use]
    pub fn root(label: &str, id: u64) -> Self {
        Self {
            path: vec![ResourceLevel {
                label: Arc::from(label),
                id,
            }],
        }
    }

    /// Extend this path by one child level.
    #[must_use]
    pub fn child(&self, label: &str, id: u64) -> Self {
        let mut path = self.path.clone();
        path.push(ResourceLevel {
            label: Arc::from(label),
            id,
        });
        Self { path }
    }

    /// The name one level up, or `None` at the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.path.len() <= 1 {
            return None;
        }
        Some(Self {
            path: self.path[..self.path.len() - 1].to_vec(),
        })
    }

    /// The final `(label, id)` pair.
    #[must_use]
    pub fn leaf(&self) -> &ResourceLevel {
        // The path is non-empty by construction.
        &self.path[self.path.len() - 1]
    }

    /// The full path, root first.
    #[must_use]
    pub fn levels(&self) -> &[ResourceLevel] {
        &self.path
    }

    /// Number of levels in the path.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.path.len()
    }

    /// Whether `self` is strictly below `ancestor` in the hierarchy.
    #[must_use]
    pub fn is_descendant_of(&self, ancestor: &Self) -> bool {
        self.path.len() > ancestor.path.len() && self.path.starts_with(&ancestor.path)
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, level) in self.path.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            if i == 0 {
                write!(f, "{}", level.label)?;
            } else {
                write!(f, "{}.{}", level.label, level.id)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_structure() {
        let db = ResourceName::root("database", 0);
        let table = db.child("table", 3);
        let page = table.child("page", 40);

        assert_eq!(page.depth(), 3);
        assert_eq!(page.parent(), Some(table.clone()));
        assert_eq!(table.parent(), Some(db.clone()));
        assert_eq!(db.parent(), None);
        assert_eq!(page.leaf().id, 40);
    }

    #[test]
    fn test_descendant_is_strict() {
        let db = ResourceName::root("database", 0);
        let table = db.child("table", 1);
        let page = table.child("page", 2);

        assert!(table.is_descendant_of(&db));
        assert!(page.is_descendant_of(&db));
        assert!(page.is_descendant_of(&table));
        assert!(!db.is_descendant_of(&db));
        assert!(!db.is_descendant_of(&table));
    }

    #[test]
    fn test_equality_by_full_path() {
        let a = ResourceName::root("database", 0).child("table", 1);
        let b = ResourceName::root("database", 0).child("table", 1);
        let c = ResourceName::root("database", 0).child("table", 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_display() {
        let page = ResourceName::root("database", 0)
            .child("partition", 2)
            .child("page", 9);
        assert_eq!(page.to_string(), "database/partition.2/page.9");
    }
}
