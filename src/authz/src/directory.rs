//! In-memory user, membership and role directory
//!
//! Implements both [`UserRepository`] and [`RoleRepository`]. Intended for
//! tests and embedded deployments; production hosts back the traits with their
//! own database.

use crate::clock::Clock;
use crate::error::{AuthzError, Result};
use crate::roles::{Role, RoleGraph, RoleRepository};
use crate::types::{BusinessUnitId, OrganizationId, RoleId, UserId};
use crate::users::{OrganizationMembership, User, UserRepository};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// In-memory directory of users, organizations and roles
pub struct InMemoryDirectory {
    users: RwLock<HashMap<UserId, User>>,
    roles: RwLock<HashMap<RoleId, Role>>,
    /// organization -> owning business unit
    organizations: RwLock<BTreeMap<OrganizationId, BusinessUnitId>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryDirectory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            roles: RwLock::new(HashMap::new()),
            organizations: RwLock::new(BTreeMap::new()),
            clock,
        }
    }

    pub fn add_organization(&self, organization_id: impl Into<String>, business_unit_id: impl Into<String>) {
        self.organizations
            .write()
            .insert(organization_id.into(), business_unit_id.into());
    }

    /// Insert or replace a user, memberships included
    pub fn put_user(&self, user: User) {
        self.users.write().insert(user.id.clone(), user);
    }

    /// Add or replace the user's membership in the membership's organization
    ///
    /// # Errors
    ///
    /// `InvalidConfig` when the user does not exist.
    pub fn grant_membership(&self, membership: OrganizationMembership) -> Result<()> {
        let mut users = self.users.write();
        let user = users.get_mut(&membership.user_id).ok_or_else(|| {
            AuthzError::InvalidConfig(format!("unknown user: {}", membership.user_id))
        })?;
        user.memberships
            .retain(|m| m.organization_id != membership.organization_id);
        user.memberships.push(membership);
        Ok(())
    }

    /// Remove the user's membership in an organization; true when one existed
    pub fn revoke_membership(&self, user_id: &str, organization_id: &str) -> bool {
        let mut users = self.users.write();
        match users.get_mut(user_id) {
            Some(user) => {
                let before = user.memberships.len();
                user.memberships.retain(|m| m.organization_id != organization_id);
                before != user.memberships.len()
            }
            None => false,
        }
    }

    /// Insert or replace a role
    ///
    /// # Errors
    ///
    /// Rejects the role when the business unit's hierarchy would contain a
    /// cycle or a dangling parent reference.
    pub fn put_role(&self, role: Role) -> Result<()> {
        let mut roles = self.roles.write();

        let candidate = roles
            .values()
            .filter(|r| r.business_unit_id == role.business_unit_id && r.id != role.id)
            .cloned()
            .chain(std::iter::once(role.clone()));
        RoleGraph::build(candidate)?;

        roles.insert(role.id.clone(), role);
        Ok(())
    }

    pub fn remove_role(&self, id: &str) -> Option<Role> {
        self.roles.write().remove(id)
    }

    fn business_unit_roles(&self, business_unit_id: &str) -> Vec<Role> {
        self.roles
            .read()
            .values()
            .filter(|r| r.business_unit_id == business_unit_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl UserRepository for InMemoryDirectory {
    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        Ok(self.users.read().get(id).cloned())
    }

    async fn memberships_in_organization(&self, organization_id: &str) -> Result<Vec<OrganizationMembership>> {
        let users = self.users.read();
        Ok(users
            .values()
            .flat_map(|u| u.memberships.iter())
            .filter(|m| m.organization_id == organization_id)
            .cloned()
            .collect())
    }

    async fn memberships_with_role(&self, role_id: &str) -> Result<Vec<OrganizationMembership>> {
        let users = self.users.read();
        Ok(users
            .values()
            .flat_map(|u| u.memberships.iter())
            .filter(|m| m.role_ids.iter().any(|r| r == role_id))
            .cloned()
            .collect())
    }

    async fn organizations_in_business_unit(&self, business_unit_id: &str) -> Result<Vec<OrganizationId>> {
        Ok(self
            .organizations
            .read()
            .iter()
            .filter(|(_, bu)| bu.as_str() == business_unit_id)
            .map(|(org, _)| org.clone())
            .collect())
    }
}

#[async_trait]
impl RoleRepository for InMemoryDirectory {
    async fn has_admin_role(&self, user_id: &str, organization_id: &str) -> Result<bool> {
        let now = self.clock.now();

        let membership = {
            let users = self.users.read();
            match users.get(user_id).and_then(|u| u.active_membership(organization_id, now)) {
                Some(m) => m.clone(),
                None => return Ok(false),
            }
        };

        let graph = RoleGraph::build(self.business_unit_roles(&membership.business_unit_id))?;
        let admin = graph
            .expand(&membership.role_ids)
            .iter()
            .filter_map(|id| graph.get(id))
            .any(|role| role.is_admin && role.is_active(now) && role.covers_organization(organization_id));

        Ok(admin)
    }

    async fn get_role(&self, id: &str) -> Result<Option<Role>> {
        Ok(self.roles.read().get(id).cloned())
    }

    async fn roles_for_business_unit(&self, business_unit_id: &str) -> Result<Vec<Role>> {
        Ok(self.business_unit_roles(business_unit_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::GraphError;
    use std::time::Duration;

    fn directory() -> (Arc<ManualClock>, InMemoryDirectory) {
        let clock = Arc::new(ManualClock::starting_now());
        let dir = InMemoryDirectory::new(clock.clone());
        dir.add_organization("org-1", "bu-1");
        dir.add_organization("org-2", "bu-1");
        dir.add_organization("org-9", "bu-9");
        (clock, dir)
    }

    #[tokio::test]
    async fn test_admin_role_detection() {
        let (_clock, dir) = directory();
        dir.put_role(Role::new("admin", "Administrator", "bu-1").admin()).unwrap();
        dir.put_role(Role::new("viewer", "Viewer", "bu-1")).unwrap();

        dir.put_user(User::new("alice", "bu-1"));
        dir.grant_membership(OrganizationMembership::new("alice", "org-1", "bu-1", &["admin"]))
            .unwrap();
        dir.grant_membership(OrganizationMembership::new("alice", "org-2", "bu-1", &["viewer"]))
            .unwrap();

        assert!(dir.has_admin_role("alice", "org-1").await.unwrap());
        assert!(!dir.has_admin_role("alice", "org-2").await.unwrap());
        assert!(!dir.has_admin_role("bob", "org-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_admin_inherited_through_parent() {
        let (_clock, dir) = directory();
        dir.put_role(Role::new("root", "Root", "bu-1").admin()).unwrap();
        dir.put_role(Role::new("ops", "Ops", "bu-1").with_parents(&["root"])).unwrap();

        dir.put_user(User::new("carol", "bu-1"));
        dir.grant_membership(OrganizationMembership::new("carol", "org-1", "bu-1", &["ops"]))
            .unwrap();

        assert!(dir.has_admin_role("carol", "org-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_admin_membership_is_not_admin() {
        let (clock, dir) = directory();
        dir.put_role(Role::new("admin", "Administrator", "bu-1").admin()).unwrap();
        dir.put_user(User::new("dave", "bu-1"));

        let expires = clock.now() + chrono::Duration::seconds(30);
        dir.grant_membership(
            OrganizationMembership::new("dave", "org-1", "bu-1", &["admin"]).expiring_at(expires),
        )
        .unwrap();
        assert!(dir.has_admin_role("dave", "org-1").await.unwrap());

        clock.advance(Duration::from_secs(31));
        assert!(!dir.has_admin_role("dave", "org-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_admin_role_is_not_admin() {
        let (clock, dir) = directory();
        let expires = clock.now() + chrono::Duration::seconds(10);
        dir.put_role(
            Role::new("temp-admin", "Temporary admin", "bu-1")
                .admin()
                .expiring_at(expires),
        )
        .unwrap();
        dir.put_user(User::new("erin", "bu-1"));
        dir.grant_membership(OrganizationMembership::new("erin", "org-1", "bu-1", &["temp-admin"]))
            .unwrap();

        assert!(dir.has_admin_role("erin", "org-1").await.unwrap());
        clock.advance(Duration::from_secs(11));
        assert!(!dir.has_admin_role("erin", "org-1").await.unwrap());
    }

    #[test]
    fn test_put_role_rejects_cycle() {
        let (_clock, dir) = directory();
        dir.put_role(Role::new("a", "A", "bu-1")).unwrap();
        dir.put_role(Role::new("b", "B", "bu-1").with_parents(&["a"])).unwrap();

        let err = dir
            .put_role(Role::new("a", "A", "bu-1").with_parents(&["b"]))
            .unwrap_err();
        assert!(matches!(err, AuthzError::Graph(GraphError::CircularDependency(_))));
    }

    #[tokio::test]
    async fn test_tenancy_queries() {
        let (_clock, dir) = directory();
        dir.put_user(User::new("alice", "bu-1"));
        dir.put_user(User::new("bob", "bu-1"));
        dir.grant_membership(OrganizationMembership::new("alice", "org-1", "bu-1", &["viewer"]))
            .unwrap();
        dir.grant_membership(OrganizationMembership::new("bob", "org-1", "bu-1", &["editor"]))
            .unwrap();

        assert_eq!(dir.memberships_in_organization("org-1").await.unwrap().len(), 2);
        assert_eq!(dir.memberships_with_role("editor").await.unwrap().len(), 1);
        assert_eq!(
            dir.organizations_in_business_unit("bu-1").await.unwrap(),
            vec!["org-1", "org-2"]
        );

        assert!(dir.revoke_membership("alice", "org-1"));
        assert!(!dir.revoke_membership("alice", "org-1"));
        assert_eq!(dir.memberships_in_organization("org-1").await.unwrap().len(), 1);
    }
}
