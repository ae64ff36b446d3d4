//! Auth and identity handlers.
//!
//! Login installs the session on the connection in place; logout and expiry
//! clear it.  Management operations forward to the identity backend.

use crate::actor::ConnectionActor;
use gate_core::permissions::{AclEntry, Resource, ResourceKind};
use gate_protocol::{GatewayError, Operation, Request};
use serde_json::{Value, json};

pub async fn login(actor: &mut ConnectionActor, req: &Request) -> Result<Value, GatewayError> {
    let username = req.require_str("username")?;
    let password = req.require_str("password")?;
    let grant = actor.state.identity.login(username, password).await?;
    actor.install_session(&grant);
    Ok(json!({ "token": grant.token, "session": grant.session }))
}

pub async fn login_with_secret(
    actor: &mut ConnectionActor,
    req: &Request,
) -> Result<Value, GatewayError> {
    let secret = req.require_str("secret")?;
    let grant = actor.state.identity.login_with_secret(secret).await?;
    actor.install_session(&grant);
    Ok(json!({ "token": grant.token, "session": grant.session }))
}

pub async fn logout(actor: &mut ConnectionActor) -> Result<Value, GatewayError> {
    if let Some(token) = actor.session_token.take() {
        actor.state.identity.logout(&token).await?;
    }
    actor.clear_session();
    Ok(json!({ "loggedOut": true }))
}

pub fn whoami(actor: &ConnectionActor) -> Value {
    match &actor.session {
        Some(session) => json!({
            "authenticated": true,
            "userId": session.user_id,
            "roles": session.roles,
            "expiresAt": session.expires_at,
        }),
        None => json!({ "authenticated": false }),
    }
}

pub async fn refresh_session(actor: &mut ConnectionActor) -> Result<Value, GatewayError> {
    let token = actor
        .session_token
        .clone()
        .ok_or_else(|| GatewayError::unauthorized("no active session"))?;
    let grant = actor.state.identity.refresh_session(&token).await?;
    actor.install_session(&grant);
    Ok(json!({ "token": grant.token, "session": grant.session }))
}

fn parse_acl_entry(req: &Request) -> Result<AclEntry, GatewayError> {
    serde_json::from_value(Value::Object(req.body.clone()))
        .map_err(|e| GatewayError::validation(format!("invalid ACL entry: {e}")))
}

fn parse_resource(req: &Request) -> Result<Resource, GatewayError> {
    let kind: ResourceKind = serde_json::from_value(json!(req.require_str("resourceType")?))
        .map_err(|_| GatewayError::validation("invalid `resourceType`"))?;
    Ok(Resource {
        kind,
        name: req.require_str("resourceName")?.to_owned(),
    })
}

pub async fn manage(
    actor: &ConnectionActor,
    op: Operation,
    req: &Request,
) -> Result<Value, GatewayError> {
    let identity = &actor.state.identity;
    match op {
        Operation::IdentityCreateUser => {
            identity.create_user(&Value::Object(req.body.clone())).await
        }
        Operation::IdentityUpdateUser => {
            identity
                .update_user(req.require_str("username")?, &Value::Object(req.body.clone()))
                .await
        }
        Operation::IdentityDeleteUser => identity.delete_user(req.require_str("username")?).await,
        Operation::IdentityGetUser => identity.get_user(req.require_str("username")?).await,
        Operation::IdentityListUsers => identity.list_users().await,
        Operation::IdentityCreateRole => identity.create_role(req.require_str("role")?).await,
        Operation::IdentityDeleteRole => identity.delete_role(req.require_str("role")?).await,
        Operation::IdentityListRoles => identity.list_roles().await,
        Operation::IdentityAssignRole => {
            identity
                .assign_role(req.require_str("username")?, req.require_str("role")?)
                .await
        }
        Operation::IdentityRevokeRole => {
            identity
                .revoke_role(req.require_str("username")?, req.require_str("role")?)
                .await
        }
        Operation::IdentityGrant => identity.grant(parse_acl_entry(req)?).await,
        Operation::IdentityRevoke => identity.revoke(&parse_acl_entry(req)?).await,
        Operation::IdentityListAcl => identity.list_acl().await,
        Operation::IdentitySetOwner => {
            identity
                .set_owner(&parse_resource(req)?, req.require_str("userId")?)
                .await
        }
        Operation::IdentityGetOwner => {
            let owner = identity.owner_of(&parse_resource(req)?).await;
            Ok(json!({ "owner": owner }))
        }
        _ => Err(GatewayError::internal("operation routed to the wrong handler")),
    }
}
