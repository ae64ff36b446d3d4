//! The permission engine.
//!
//! Resolves `(session, operation, resource)` to allow/deny.  Decision order,
//! first match wins:
//!
//! 1. `superadmin` role (the only identity that bypasses every check)
//! 2. built-in tier ceiling: `reader`/`writer`/`admin` cap the reachable
//!    tier unconditionally -- no ACL entry or ownership lifts a `reader`
//!    above read.  Custom roles skip this filter.
//! 3. user ACL entry
//! 4. role ACL entry
//! 5. resource ownership
//! 6. custom check callback, when configured (overrides the declarative
//!    rules; an undecided result falls through)
//! 7. declarative role rules
//! 8. configured default

use crate::session::{ROLE_SUPERADMIN, Session};
use gate_protocol::{Namespace, Operation, Request, Tier};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    User,
    Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    #[serde(rename = "bucket")]
    Bucket,
    #[serde(rename = "topic")]
    Topic,
    #[serde(rename = "*")]
    Any,
}

/// The resource a request addresses, derived from the operation namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
    pub kind: ResourceKind,
    pub name: String,
}

impl Resource {
    pub fn any() -> Self {
        Resource {
            kind: ResourceKind::Any,
            name: "*".to_owned(),
        }
    }
}

/// One ACL grant: a subject gets a subset of tiers on one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AclEntry {
    #[serde(rename = "subjectType")]
    pub subject_kind: SubjectKind,
    pub subject_id: String,
    #[serde(rename = "resourceType")]
    pub resource_kind: ResourceKind,
    /// `"*"` grants on every resource of the kind.
    pub resource_name: String,
    pub operations: Vec<Tier>,
}

impl AclEntry {
    fn applies_to(&self, resource: &Resource) -> bool {
        (self.resource_kind == resource.kind || self.resource_kind == ResourceKind::Any)
            && (self.resource_name == "*" || self.resource_name == resource.name)
    }
}

/// A declarative per-role rule: operation patterns plus optional
/// bucket/topic constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolePermission {
    pub role: String,
    /// Operation patterns: exact (`store.get`), prefix (`store.*`), or `*`.
    pub allow: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buckets: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,
}

impl RolePermission {
    fn matches(&self, op: Operation, resource: &Resource) -> bool {
        if !self
            .allow
            .iter()
            .any(|p| wildcard_match(p, op.wire_name()))
        {
            return false;
        }
        let constraint = match resource.kind {
            ResourceKind::Bucket => self.buckets.as_ref(),
            ResourceKind::Topic => self.topics.as_ref(),
            ResourceKind::Any => None,
        };
        match constraint {
            Some(names) => names.iter().any(|n| wildcard_match(n, &resource.name)),
            None => true,
        }
    }
}

/// `*` matches everything; `prefix.*` matches `prefix.` followed by
/// anything; otherwise exact.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return name
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'));
    }
    pattern == name
}

/// Derive the resource a request addresses from its operation namespace.
pub fn extract_resource(op: Operation, req: &Request) -> Resource {
    match op.namespace() {
        Namespace::Store => {
            let name = match op {
                Operation::StoreSubscribe => req.str_field("query"),
                Operation::StoreUnsubscribe => req.str_field("subscriptionId"),
                _ => req.str_field("bucket"),
            };
            Resource {
                kind: ResourceKind::Bucket,
                name: name.unwrap_or("*").to_owned(),
            }
        }
        Namespace::Rules => {
            let name = req
                .str_field("topic")
                .or_else(|| req.str_field("key"))
                .or_else(|| req.str_field("pattern"));
            Resource {
                kind: ResourceKind::Topic,
                name: name.unwrap_or("*").to_owned(),
            }
        }
        _ => Resource::any(),
    }
}

/// Custom override hook.  `Some(decision)` terminates the check; `None`
/// falls through to the configured default.
pub type CustomCheck = dyn Fn(&Session, Operation, &Resource) -> Option<bool> + Send + Sync;

pub struct PermissionEngine {
    role_rules: Vec<RolePermission>,
    default_allow: bool,
    custom_check: Option<Arc<CustomCheck>>,
}

impl PermissionEngine {
    pub fn new(role_rules: Vec<RolePermission>, default_allow: bool) -> Self {
        PermissionEngine {
            role_rules,
            default_allow,
            custom_check: None,
        }
    }

    /// Permissive engine: no rules, default allow.
    pub fn permissive() -> Self {
        PermissionEngine::new(Vec::new(), true)
    }

    pub fn with_custom_check(mut self, check: Arc<CustomCheck>) -> Self {
        self.custom_check = Some(check);
        self
    }

    /// Resolve an access decision.  `acl` and `owner` are the entries and
    /// ownership the identity store holds for this session and resource.
    pub fn decide(
        &self,
        session: Option<&Session>,
        op: Operation,
        resource: &Resource,
        acl: &[AclEntry],
        owner: Option<&str>,
    ) -> bool {
        let Some(session) = session else {
            // Anonymous connections carry no grants; only the default applies.
            return self.default_allow;
        };

        if session.has_role(ROLE_SUPERADMIN) {
            return true;
        }

        let tier = op.tier();

        // The built-in tier floor is absolute: it caps ACL and ownership
        // grants too, not just the declarative rules.
        if let Some(ceiling) = session.builtin_ceiling()
            && tier > ceiling
        {
            return false;
        }

        let user_grant = acl.iter().any(|e| {
            e.subject_kind == SubjectKind::User
                && e.subject_id == session.user_id
                && e.applies_to(resource)
                && e.operations.contains(&tier)
        });
        if user_grant {
            return true;
        }

        let role_grant = acl.iter().any(|e| {
            e.subject_kind == SubjectKind::Role
                && session.has_role(&e.subject_id)
                && e.applies_to(resource)
                && e.operations.contains(&tier)
        });
        if role_grant {
            return true;
        }

        if owner == Some(session.user_id.as_str()) {
            return true;
        }

        if let Some(check) = &self.custom_check
            && let Some(decision) = check(session, op, resource)
        {
            return decision;
        }

        for rule in &self.role_rules {
            if session.has_role(&rule.role) && rule.matches(op, resource) {
                return true;
            }
        }

        self.default_allow
    }
}
