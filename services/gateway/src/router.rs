//! Request pipeline and dispatch.
//!
//! Every request runs `parse -> auth -> rate limit -> permission -> handler`
//! and yields exactly one terminal frame.  Typed errors pass through;
//! `INTERNAL_ERROR` details are elided unless the operator opts in.

use crate::actor::ConnectionActor;
use crate::ops;
use gate_core::audit::{AuditEntry, AuditResult};
use gate_core::permissions::{Resource, extract_resource};
use gate_core::epoch_ms;
use gate_protocol::{ErrorCode, GatewayError, Operation, Request, ServerFrame};
use serde_json::{Value, json};

pub async fn process(actor: &mut ConnectionActor, req: Request) -> ServerFrame {
    let id = req.id.clone();
    match run_pipeline(actor, &req).await {
        Ok(data) => ServerFrame::result(id, data),
        Err(err) => ServerFrame::error(
            id,
            redact(err, actor.state.config.errors.expose_details),
        ),
    }
}

fn redact(mut err: GatewayError, expose_details: bool) -> GatewayError {
    if err.code == ErrorCode::InternalError && !expose_details {
        err.details = None;
    }
    err
}

async fn run_pipeline(
    actor: &mut ConnectionActor,
    req: &Request,
) -> Result<Value, GatewayError> {
    let Some(op) = Operation::parse(&req.op) else {
        return Err(GatewayError::new(
            ErrorCode::UnknownOperation,
            format!("unknown operation `{}`", req.op),
        ));
    };
    let resource = extract_resource(op, req);
    let result = checked_dispatch(actor, op, req, &resource).await;

    if op != Operation::Ping {
        actor.state.audit.record(AuditEntry {
            timestamp: epoch_ms(),
            user_id: actor.session.as_ref().map(|s| s.user_id.clone()),
            session_id: Some(actor.connection_id.clone()),
            operation: op.wire_name().to_owned(),
            resource: resource.name.clone(),
            result: if result.is_ok() {
                AuditResult::Success
            } else {
                AuditResult::Error
            },
            error: result
                .as_ref()
                .err()
                .map(|e| e.code.as_str().to_owned()),
            details: None,
            remote_address: actor.remote_address.clone(),
        });
    }
    result
}

async fn checked_dispatch(
    actor: &mut ConnectionActor,
    op: Operation,
    req: &Request,
    resource: &Resource,
) -> Result<Value, GatewayError> {
    let now = epoch_ms();

    // Expiry is lazy: any operation that observes a stale session clears it
    // before responding.
    let expired = actor.session.as_ref().is_some_and(|s| s.is_expired(now));
    if expired {
        actor.clear_session();
    }

    if actor.state.config.auth.required && !op.skips_auth() {
        if expired {
            return Err(GatewayError::unauthorized("session expired"));
        }
        if actor.session.is_none() {
            return Err(GatewayError::unauthorized("authentication required"));
        }
    }

    if let Some(limiter) = &actor.state.rate_limiter {
        let key = rate_key(actor);
        limiter
            .consume(&key, now)
            .map_err(|retry_after_ms| {
                GatewayError::rate_limited("rate limit exceeded", retry_after_ms)
            })?;
    }

    if !op.skips_auth() {
        let (acl, owner) = match &actor.session {
            Some(session) => (
                actor.state.identity.acl_for(session).await,
                actor.state.identity.owner_of(resource).await,
            ),
            None => (Vec::new(), None),
        };
        let allowed = actor.state.permissions.decide(
            actor.session.as_ref(),
            op,
            resource,
            &acl,
            owner.as_deref(),
        );
        if !allowed {
            return Err(GatewayError::forbidden(format!(
                "operation `{}` is not permitted",
                op.wire_name()
            )));
        }
    }

    dispatch(actor, op, req).await
}

/// Authenticated traffic is budgeted per user id, anonymous per remote IP.
/// The key is chosen at admission, so the switchover takes effect on the
/// first request after a successful login.
fn rate_key(actor: &ConnectionActor) -> String {
    match &actor.session {
        Some(session) => format!("user:{}", session.user_id),
        None => format!("ip:{}", remote_ip(&actor.remote_address)),
    }
}

pub(crate) fn remote_ip(remote: &str) -> &str {
    remote.rsplit_once(':').map_or(remote, |(ip, _)| ip)
}

async fn dispatch(
    actor: &mut ConnectionActor,
    op: Operation,
    req: &Request,
) -> Result<Value, GatewayError> {
    use Operation as Op;
    match op {
        Op::Ping => Ok(json!({ "timestamp": epoch_ms() })),

        Op::AuthLogin | Op::IdentityLogin => ops::identity::login(actor, req).await,
        Op::IdentityLoginWithSecret => ops::identity::login_with_secret(actor, req).await,
        Op::AuthLogout | Op::IdentityLogout => ops::identity::logout(actor).await,
        Op::IdentityWhoami => Ok(ops::identity::whoami(actor)),
        Op::IdentityRefreshSession => ops::identity::refresh_session(actor).await,
        Op::IdentityCreateUser
        | Op::IdentityUpdateUser
        | Op::IdentityDeleteUser
        | Op::IdentityGetUser
        | Op::IdentityListUsers
        | Op::IdentityCreateRole
        | Op::IdentityDeleteRole
        | Op::IdentityListRoles
        | Op::IdentityAssignRole
        | Op::IdentityRevokeRole
        | Op::IdentityGrant
        | Op::IdentityRevoke
        | Op::IdentityListAcl
        | Op::IdentitySetOwner
        | Op::IdentityGetOwner => ops::identity::manage(actor, op, req).await,

        Op::StoreSubscribe => ops::store::subscribe(actor, req).await,
        Op::StoreUnsubscribe => ops::store::unsubscribe(actor, req),
        Op::StoreGet
        | Op::StoreAll
        | Op::StoreWhere
        | Op::StoreFindOne
        | Op::StoreCount
        | Op::StoreFirst
        | Op::StoreLast
        | Op::StorePaginate
        | Op::StoreSum
        | Op::StoreAvg
        | Op::StoreMin
        | Op::StoreMax
        | Op::StoreInsert
        | Op::StoreUpdate
        | Op::StoreDelete
        | Op::StoreClear
        | Op::StoreTransaction
        | Op::StoreBuckets
        | Op::StoreStats
        | Op::StoreDefineBucket
        | Op::StoreDropBucket
        | Op::StoreUpdateBucket
        | Op::StoreGetBucketSchema
        | Op::StoreDefineQuery
        | Op::StoreUndefineQuery
        | Op::StoreListQueries => ops::store::dispatch(actor, op, req).await,

        Op::RulesSubscribe => ops::rules::subscribe(actor, req).await,
        Op::RulesUnsubscribe => ops::rules::unsubscribe(actor, req),
        Op::RulesEmit
        | Op::RulesEmitCorrelated
        | Op::RulesSetFact
        | Op::RulesGetFact
        | Op::RulesDeleteFact
        | Op::RulesQueryFacts
        | Op::RulesGetAllFacts
        | Op::RulesRegister
        | Op::RulesUnregister
        | Op::RulesUpdate
        | Op::RulesEnable
        | Op::RulesDisable
        | Op::RulesGet
        | Op::RulesList
        | Op::RulesValidate
        | Op::RulesStats => ops::rules::dispatch(actor, op, req).await,

        Op::ServerStats => Ok(ops::server_info::stats(actor)),
        Op::ServerConnections => Ok(ops::server_info::connections(actor)),

        Op::AuditQuery => ops::audit::query(actor, req),
    }
}
