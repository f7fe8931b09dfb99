//! Role hierarchy graph with DFS cycle detection
//!
//! Roles live in a flat map keyed by id and name their parents by id. Building
//! the graph rejects duplicates, dangling parents and cycles, so every later
//! traversal terminates.

use super::Role;
use crate::error::GraphError;
use crate::types::RoleId;
use std::collections::{BTreeSet, HashMap};

/// Visit state during cycle detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Validated role hierarchy of one business unit
#[derive(Debug, Clone, Default)]
pub struct RoleGraph {
    roles: HashMap<RoleId, Role>,
    /// parent id -> roles that name it as parent
    children: HashMap<RoleId, Vec<RoleId>>,
}

impl RoleGraph {
    /// Build and validate a hierarchy
    ///
    /// # Errors
    ///
    /// - `DuplicateRole` when two roles share an id
    /// - `UnknownParent` when a parent id is not part of `roles`
    /// - `CircularDependency` with the full cycle path
    pub fn build(roles: impl IntoIterator<Item = Role>) -> Result<Self, GraphError> {
        let mut by_id: HashMap<RoleId, Role> = HashMap::new();
        for role in roles {
            if by_id.contains_key(&role.id) {
                return Err(GraphError::DuplicateRole(role.id));
            }
            by_id.insert(role.id.clone(), role);
        }

        let mut children: HashMap<RoleId, Vec<RoleId>> = HashMap::new();
        for role in by_id.values() {
            for parent in &role.parent_roles {
                if !by_id.contains_key(parent) {
                    return Err(GraphError::UnknownParent {
                        role: role.id.clone(),
                        parent: parent.clone(),
                    });
                }
                children.entry(parent.clone()).or_default().push(role.id.clone());
            }
        }

        let graph = Self { roles: by_id, children };
        graph.detect_cycles()?;
        Ok(graph)
    }

    pub fn get(&self, id: &str) -> Option<&Role> {
        self.roles.get(id)
    }

    pub fn roles(&self) -> impl Iterator<Item = &Role> {
        self.roles.values()
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// `id` plus every role it inherits from
    pub fn ancestors(&self, id: &str) -> BTreeSet<RoleId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(role) = self.roles.get(&current) {
                stack.extend(role.parent_roles.iter().cloned());
            }
        }
        seen
    }

    /// `id` plus every role that inherits from it
    pub fn descendants(&self, id: &str) -> BTreeSet<RoleId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(kids) = self.children.get(&current) {
                stack.extend(kids.iter().cloned());
            }
        }
        seen
    }

    /// Union of ancestors over every held role
    pub fn expand<'a>(&self, held: impl IntoIterator<Item = &'a RoleId>) -> BTreeSet<RoleId> {
        held.into_iter().flat_map(|id| self.ancestors(id)).collect()
    }

    fn detect_cycles(&self) -> Result<(), GraphError> {
        let mut marks: HashMap<&str, Mark> = HashMap::new();

        // Sorted start order keeps the reported path stable
        let mut ids: Vec<&str> = self.roles.keys().map(String::as_str).collect();
        ids.sort_unstable();

        for start in ids {
            if !marks.contains_key(start) {
                let mut path = Vec::new();
                self.visit(start, &mut marks, &mut path)?;
            }
        }
        Ok(())
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Result<(), GraphError> {
        match marks.get(node) {
            Some(Mark::Visiting) => {
                let start = path.iter().position(|n| *n == node).unwrap_or(0);
                let mut cycle: Vec<&str> = path[start..].to_vec();
                cycle.push(node);
                return Err(GraphError::CircularDependency(cycle.join(" -> ")));
            }
            Some(Mark::Done) => return Ok(()),
            None => {}
        }

        marks.insert(node, Mark::Visiting);
        path.push(node);

        if let Some(role) = self.roles.get(node) {
            for parent in &role.parent_roles {
                self.visit(parent.as_str(), marks, path)?;
            }
        }

        path.pop();
        marks.insert(node, Mark::Done);
        Ok(())
    }
}
