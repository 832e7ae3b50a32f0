//! Role-based access control.
//!
//! Actors hold roles; roles grant `resource:action` permissions, optionally
//! scoped to repositories. Checks fail closed: an unknown actor, role, or
//! permission denies.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};

/// A permission in `resource:action` form, e.g. `jobs:create`.
/// `resource:*` and `*` act as wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission(pub String);

impl Permission {
    pub fn new(permission: impl Into<String>) -> Self {
        Self(permission.into())
    }

    /// Whether this (possibly wildcard) permission grants `requested`.
    pub fn grants(&self, requested: &str) -> bool {
        if self.0 == "*" || self.0 == requested {
            return true;
        }
        match (self.0.split_once(':'), requested.split_once(':')) {
            (Some((resource, "*")), Some((req_resource, _))) => resource == req_resource,
            _ => false,
        }
    }
}

/// A named bundle of permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub permissions: Vec<Permission>,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            permissions: Vec::new(),
        }
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(Permission::new(permission));
        self
    }
}

/// Scope limiting a role assignment to certain repositories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentScope {
    /// Applies everywhere.
    Global,
    /// Applies only within the named repositories.
    Repositories(Vec<String>),
}

/// One role held by an actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub role: String,
    pub scope: AssignmentScope,
}

/// Context an access check runs in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessContext {
    pub repository: Option<String>,
}

impl AccessContext {
    pub fn repository(repo: impl Into<String>) -> Self {
        Self {
            repository: Some(repo.into()),
        }
    }
}

struct RbacState {
    roles: HashMap<String, Role>,
    assignments: HashMap<String, Vec<RoleAssignment>>,
}

/// RBAC engine. When disabled, every check passes.
pub struct Rbac {
    enabled: bool,
    state: RwLock<RbacState>,
}

impl Rbac {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state: RwLock::new(RbacState {
                roles: HashMap::new(),
                assignments: HashMap::new(),
            }),
        }
    }

    /// The built-in roles a fresh installation starts with.
    pub async fn install_defaults(&self) {
        self.define_role(
            Role::new("admin").with_permission("*"),
        )
        .await;
        self.define_role(
            Role::new("operator")
                .with_permission("jobs:*")
                .with_permission("runners:read")
                .with_permission("pools:read"),
        )
        .await;
        self.define_role(
            Role::new("submitter").with_permission("jobs:create"),
        )
        .await;
        self.define_role(Role::new("viewer").with_permission("jobs:read")).await;
    }

    pub async fn define_role(&self, role: Role) {
        self.state.write().await.roles.insert(role.name.clone(), role);
    }

    pub async fn assign(&self, actor: impl Into<String>, assignment: RoleAssignment) {
        self.state
            .write()
            .await
            .assignments
            .entry(actor.into())
            .or_default()
            .push(assignment);
    }

    pub async fn revoke_all(&self, actor: &str) {
        self.state.write().await.assignments.remove(actor);
    }

    /// Check a permission in context. Fails closed when RBAC is enabled
    /// and nothing grants the permission.
    pub async fn check(
        &self,
        actor: &str,
        permission: &str,
        context: &AccessContext,
    ) -> OrchestratorResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let state = self.state.read().await;
        let assignments = state.assignments.get(actor);
        let granted = assignments.is_some_and(|assignments| {
            assignments.iter().any(|assignment| {
                let in_scope = match &assignment.scope {
                    AssignmentScope::Global => true,
                    AssignmentScope::Repositories(repos) => context
                        .repository
                        .as_ref()
                        .is_some_and(|repo| repos.iter().any(|r| r == repo)),
                };
                in_scope
                    && state
                        .roles
                        .get(&assignment.role)
                        .is_some_and(|role| {
                            role.permissions.iter().any(|p| p.grants(permission))
                        })
            })
        });

        if granted {
            debug!(actor, permission, "access granted");
            Ok(())
        } else {
            Err(OrchestratorError::PermissionDenied {
                actor: actor.to_string(),
                permission: permission.to_string(),
            })
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_wildcards() {
        assert!(Permission::new("*").grants("jobs:create"));
        assert!(Permission::new("jobs:*").grants("jobs:create"));
        assert!(Permission::new("jobs:create").grants("jobs:create"));
        assert!(!Permission::new("jobs:read").grants("jobs:create"));
        assert!(!Permission::new("runners:*").grants("jobs:create"));
    }

    #[tokio::test]
    async fn test_disabled_allows_everything() {
        let rbac = Rbac::new(false);
        assert!(rbac
            .check("nobody", "jobs:create", &AccessContext::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_unknown_actor_denied() {
        let rbac = Rbac::new(true);
        rbac.install_defaults().await;
        let err = rbac
            .check("ghost", "jobs:create", &AccessContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn test_global_assignment_grants() {
        let rbac = Rbac::new(true);
        rbac.install_defaults().await;
        rbac.assign(
            "ci-bot",
            RoleAssignment {
                role: "submitter".to_string(),
                scope: AssignmentScope::Global,
            },
        )
        .await;

        assert!(rbac
            .check("ci-bot", "jobs:create", &AccessContext::repository("acme/web"))
            .await
            .is_ok());
        // The submitter role grants only jobs:create.
        assert!(rbac
            .check("ci-bot", "jobs:delete", &AccessContext::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_repository_scoped_assignment() {
        let rbac = Rbac::new(true);
        rbac.install_defaults().await;
        rbac.assign(
            "dev",
            RoleAssignment {
                role: "operator".to_string(),
                scope: AssignmentScope::Repositories(vec!["acme/web".to_string()]),
            },
        )
        .await;

        assert!(rbac
            .check("dev", "jobs:create", &AccessContext::repository("acme/web"))
            .await
            .is_ok());
        assert!(rbac
            .check("dev", "jobs:create", &AccessContext::repository("acme/api"))
            .await
            .is_err());
        // No repository in context: scoped assignment does not apply.
        assert!(rbac
            .check("dev", "jobs:create", &AccessContext::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_revoke_all() {
        let rbac = Rbac::new(true);
        rbac.install_defaults().await;
        rbac.assign(
            "temp",
            RoleAssignment {
                role: "admin".to_string(),
                scope: AssignmentScope::Global,
            },
        )
        .await;
        assert!(rbac
            .check("temp", "jobs:create", &AccessContext::default())
            .await
            .is_ok());

        rbac.revoke_all("temp").await;
        assert!(rbac
            .check("temp", "jobs:create", &AccessContext::default())
            .await
            .is_err());
    }
}
