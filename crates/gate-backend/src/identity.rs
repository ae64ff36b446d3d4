//! In-memory identity store.
//!
//! Users carry sha-256 password digests; sessions are opaque random tokens
//! with optional TTL and lazy expiry.  A bootstrap superadmin secret allows
//! first login before any user exists.

use async_trait::async_trait;
use gate_core::backend::{AuthGrant, IdentityBackend};
use gate_core::permissions::{AclEntry, Resource};
use gate_core::session::{ROLE_ADMIN, ROLE_READER, ROLE_SUPERADMIN, ROLE_WRITER, Session};
use gate_core::epoch_ms;
use gate_protocol::GatewayError;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

const BUILTIN_ROLES: [&str; 4] = [ROLE_SUPERADMIN, ROLE_ADMIN, ROLE_WRITER, ROLE_READER];

pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

fn new_token() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

#[derive(Debug, Clone)]
struct UserRecord {
    username: String,
    password_hash: String,
    roles: Vec<String>,
    metadata: Option<Value>,
}

impl UserRecord {
    fn public_view(&self) -> Value {
        json!({
            "username": self.username,
            "roles": self.roles,
            "metadata": self.metadata,
        })
    }
}

struct IdentityInner {
    users: BTreeMap<String, UserRecord>,
    custom_roles: BTreeSet<String>,
    sessions: HashMap<String, Session>,
    acl: Vec<AclEntry>,
    owners: HashMap<Resource, String>,
}

/// Construction options.
#[derive(Debug, Clone, Default)]
pub struct IdentityOptions {
    /// Applied to every session; `None` means sessions do not expire.
    pub session_ttl_ms: Option<i64>,
    /// Bootstrap secret for `identity.loginWithSecret`.
    pub superadmin_secret: Option<String>,
}

pub struct MemoryIdentity {
    inner: Arc<Mutex<IdentityInner>>,
    session_ttl_ms: Option<i64>,
    superadmin_secret_hash: Option<String>,
}

impl MemoryIdentity {
    pub fn new(options: IdentityOptions) -> Self {
        MemoryIdentity {
            inner: Arc::new(Mutex::new(IdentityInner {
                users: BTreeMap::new(),
                custom_roles: BTreeSet::new(),
                sessions: HashMap::new(),
                acl: Vec::new(),
                owners: HashMap::new(),
            })),
            session_ttl_ms: options.session_ttl_ms,
            superadmin_secret_hash: options.superadmin_secret.as_deref().map(sha256_hex),
        }
    }

    /// Seed a user; builder-style, for wiring and tests.
    pub fn with_user(self, username: &str, password: &str, roles: &[&str]) -> Self {
        {
            let mut inner = self.lock();
            inner.users.insert(
                username.to_owned(),
                UserRecord {
                    username: username.to_owned(),
                    password_hash: sha256_hex(password),
                    roles: roles.iter().map(|r| (*r).to_owned()).collect(),
                    metadata: None,
                },
            );
        }
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IdentityInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expires_at(&self) -> Option<i64> {
        self.session_ttl_ms.map(|ttl| epoch_ms() + ttl)
    }

    fn grant_session(&self, inner: &mut IdentityInner, session: Session) -> AuthGrant {
        let token = new_token();
        inner.sessions.insert(token.clone(), session.clone());
        AuthGrant { token, session }
    }
}

fn role_exists(inner: &IdentityInner, role: &str) -> bool {
    BUILTIN_ROLES.contains(&role) || inner.custom_roles.contains(role)
}

#[async_trait]
impl IdentityBackend for MemoryIdentity {
    async fn login(&self, username: &str, password: &str) -> Result<AuthGrant, GatewayError> {
        let mut inner = self.lock();
        let user = inner
            .users
            .get(username)
            .filter(|u| u.password_hash == sha256_hex(password))
            .cloned()
            .ok_or_else(|| GatewayError::unauthorized("invalid credentials"))?;
        let session = Session {
            user_id: user.username,
            roles: user.roles,
            expires_at: self.expires_at(),
            metadata: user.metadata,
        };
        Ok(self.grant_session(&mut inner, session))
    }

    async fn login_with_secret(&self, secret: &str) -> Result<AuthGrant, GatewayError> {
        let expected = self
            .superadmin_secret_hash
            .as_deref()
            .ok_or_else(|| GatewayError::unauthorized("no bootstrap secret configured"))?;
        if sha256_hex(secret) != expected {
            return Err(GatewayError::unauthorized("invalid secret"));
        }
        let session = Session {
            user_id: ROLE_SUPERADMIN.to_owned(),
            roles: vec![ROLE_SUPERADMIN.to_owned()],
            expires_at: self.expires_at(),
            metadata: None,
        };
        let mut inner = self.lock();
        Ok(self.grant_session(&mut inner, session))
    }

    async fn logout(&self, token: &str) -> Result<(), GatewayError> {
        self.lock().sessions.remove(token);
        Ok(())
    }

    async fn validate_session(&self, token: &str) -> Option<Session> {
        let mut inner = self.lock();
        let session = inner.sessions.get(token)?.clone();
        if session.is_expired(epoch_ms()) {
            inner.sessions.remove(token);
            return None;
        }
        Some(session)
    }

    async fn refresh_session(&self, token: &str) -> Result<AuthGrant, GatewayError> {
        let mut inner = self.lock();
        let session = inner
            .sessions
            .get_mut(token)
            .ok_or_else(|| GatewayError::unauthorized("unknown session"))?;
        if session.is_expired(epoch_ms()) {
            inner.sessions.remove(token);
            return Err(GatewayError::unauthorized("session expired"));
        }
        session.expires_at = self.expires_at();
        Ok(AuthGrant {
            token: token.to_owned(),
            session: session.clone(),
        })
    }

    async fn create_user(&self, definition: &Value) -> Result<Value, GatewayError> {
        let username = definition
            .get("username")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::validation("missing `username`"))?;
        let password = definition
            .get("password")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::validation("missing `password`"))?;
        let roles: Vec<String> = match definition.get("roles") {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|_| GatewayError::validation("`roles` must be an array of strings"))?,
            None => Vec::new(),
        };
        let mut inner = self.lock();
        if inner.users.contains_key(username) {
            return Err(GatewayError::already_exists(format!(
                "user `{username}` already exists"
            )));
        }
        for role in &roles {
            if !role_exists(&inner, role) {
                return Err(GatewayError::not_found(format!("role `{role}` not found")));
            }
        }
        let record = UserRecord {
            username: username.to_owned(),
            password_hash: sha256_hex(password),
            roles,
            metadata: definition.get("metadata").cloned(),
        };
        let view = record.public_view();
        inner.users.insert(username.to_owned(), record);
        Ok(view)
    }

    async fn update_user(&self, username: &str, patch: &Value) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        if let Some(roles) = patch.get("roles") {
            let roles: Vec<String> = serde_json::from_value(roles.clone())
                .map_err(|_| GatewayError::validation("`roles` must be an array of strings"))?;
            for role in &roles {
                if !role_exists(&inner, role) {
                    return Err(GatewayError::not_found(format!("role `{role}` not found")));
                }
            }
            let user = inner
                .users
                .get_mut(username)
                .ok_or_else(|| GatewayError::not_found(format!("user `{username}` not found")))?;
            user.roles = roles;
        }
        let user = inner
            .users
            .get_mut(username)
            .ok_or_else(|| GatewayError::not_found(format!("user `{username}` not found")))?;
        if let Some(password) = patch.get("password").and_then(Value::as_str) {
            user.password_hash = sha256_hex(password);
        }
        if let Some(metadata) = patch.get("metadata") {
            user.metadata = Some(metadata.clone());
        }
        Ok(user.public_view())
    }

    async fn delete_user(&self, username: &str) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        if inner.users.remove(username).is_none() {
            return Err(GatewayError::not_found(format!(
                "user `{username}` not found"
            )));
        }
        // Revoke the user's live sessions along with the account.
        inner.sessions.retain(|_, s| s.user_id != username);
        Ok(json!({ "deleted": true, "username": username }))
    }

    async fn get_user(&self, username: &str) -> Result<Value, GatewayError> {
        let inner = self.lock();
        inner
            .users
            .get(username)
            .map(UserRecord::public_view)
            .ok_or_else(|| GatewayError::not_found(format!("user `{username}` not found")))
    }

    async fn list_users(&self) -> Result<Value, GatewayError> {
        let inner = self.lock();
        Ok(Value::Array(
            inner.users.values().map(UserRecord::public_view).collect(),
        ))
    }

    async fn create_role(&self, role: &str) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        if BUILTIN_ROLES.contains(&role) || !inner.custom_roles.insert(role.to_owned()) {
            return Err(GatewayError::already_exists(format!(
                "role `{role}` already exists"
            )));
        }
        Ok(json!({ "created": true, "role": role }))
    }

    async fn delete_role(&self, role: &str) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        if BUILTIN_ROLES.contains(&role) {
            return Err(GatewayError::conflict(format!(
                "built-in role `{role}` cannot be deleted"
            )));
        }
        if !inner.custom_roles.remove(role) {
            return Err(GatewayError::not_found(format!("role `{role}` not found")));
        }
        for user in inner.users.values_mut() {
            user.roles.retain(|r| r != role);
        }
        Ok(json!({ "deleted": true, "role": role }))
    }

    async fn list_roles(&self) -> Result<Value, GatewayError> {
        let inner = self.lock();
        let mut roles: Vec<&str> = BUILTIN_ROLES.to_vec();
        roles.extend(inner.custom_roles.iter().map(String::as_str));
        Ok(json!(roles))
    }

    async fn assign_role(&self, username: &str, role: &str) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        if !role_exists(&inner, role) {
            return Err(GatewayError::not_found(format!("role `{role}` not found")));
        }
        let user = inner
            .users
            .get_mut(username)
            .ok_or_else(|| GatewayError::not_found(format!("user `{username}` not found")))?;
        if !user.roles.iter().any(|r| r == role) {
            user.roles.push(role.to_owned());
        }
        Ok(user.public_view())
    }

    async fn revoke_role(&self, username: &str, role: &str) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        let user = inner
            .users
            .get_mut(username)
            .ok_or_else(|| GatewayError::not_found(format!("user `{username}` not found")))?;
        user.roles.retain(|r| r != role);
        Ok(user.public_view())
    }

    async fn grant(&self, entry: AclEntry) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        if !inner.acl.contains(&entry) {
            inner.acl.push(entry);
        }
        Ok(json!({ "granted": true }))
    }

    async fn revoke(&self, entry: &AclEntry) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        let before = inner.acl.len();
        inner.acl.retain(|e| e != entry);
        Ok(json!({ "revoked": before - inner.acl.len() }))
    }

    async fn list_acl(&self) -> Result<Value, GatewayError> {
        let inner = self.lock();
        Ok(serde_json::to_value(&inner.acl)?)
    }

    async fn acl_for(&self, session: &Session) -> Vec<AclEntry> {
        use gate_core::permissions::SubjectKind;
        let inner = self.lock();
        inner
            .acl
            .iter()
            .filter(|e| match e.subject_kind {
                SubjectKind::User => e.subject_id == session.user_id,
                SubjectKind::Role => session.has_role(&e.subject_id),
            })
            .cloned()
            .collect()
    }

    async fn set_owner(&self, resource: &Resource, user_id: &str) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        inner.owners.insert(resource.clone(), user_id.to_owned());
        Ok(json!({ "owner": user_id }))
    }

    async fn owner_of(&self, resource: &Resource) -> Option<String> {
        let inner = self.lock();
        inner.owners.get(resource).cloned()
    }
}
