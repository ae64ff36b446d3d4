//! The closed operation set.
//!
//! The open `type` string from the wire is mapped exactly once into
//! [`Operation`]; everything downstream (permission tiers, dispatch) matches
//! exhaustively on the enum.  Unknown strings are `UNKNOWN_OPERATION`.

use serde::{Deserialize, Serialize};

/// Coarse operation classification used by built-in role gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Read,
    Write,
    Admin,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Read => "read",
            Tier::Write => "write",
            Tier::Admin => "admin",
        }
    }
}

/// Operation namespaces, used for resource extraction and handler routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Auth,
    Identity,
    Store,
    Rules,
    Server,
    Audit,
    Ping,
}

macro_rules! operations {
    ($( $variant:ident => ($wire:literal, $ns:ident, $tier:ident) ),* $(,)?) => {
        /// Every operation the gateway dispatches.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Operation {
            $( $variant, )*
        }

        impl Operation {
            /// Map a wire `type` string to an operation.
            pub fn parse(s: &str) -> Option<Operation> {
                match s {
                    $( $wire => Some(Operation::$variant), )*
                    _ => None,
                }
            }

            pub fn wire_name(self) -> &'static str {
                match self {
                    $( Operation::$variant => $wire, )*
                }
            }

            pub fn namespace(self) -> Namespace {
                match self {
                    $( Operation::$variant => Namespace::$ns, )*
                }
            }

            pub fn tier(self) -> Tier {
                match self {
                    $( Operation::$variant => Tier::$tier, )*
                }
            }

            /// The full operation table, in wire order.
            pub fn all() -> &'static [Operation] {
                &[ $( Operation::$variant, )* ]
            }
        }
    };
}

operations! {
    AuthLogin => ("auth.login", Auth, Read),
    AuthLogout => ("auth.logout", Auth, Read),

    IdentityLogin => ("identity.login", Identity, Read),
    IdentityLoginWithSecret => ("identity.loginWithSecret", Identity, Read),
    IdentityLogout => ("identity.logout", Identity, Read),
    IdentityWhoami => ("identity.whoami", Identity, Read),
    IdentityRefreshSession => ("identity.refreshSession", Identity, Read),
    IdentityCreateUser => ("identity.createUser", Identity, Admin),
    IdentityUpdateUser => ("identity.updateUser", Identity, Admin),
    IdentityDeleteUser => ("identity.deleteUser", Identity, Admin),
    IdentityGetUser => ("identity.getUser", Identity, Admin),
    IdentityListUsers => ("identity.listUsers", Identity, Admin),
    IdentityCreateRole => ("identity.createRole", Identity, Admin),
    IdentityDeleteRole => ("identity.deleteRole", Identity, Admin),
    IdentityListRoles => ("identity.listRoles", Identity, Admin),
    IdentityAssignRole => ("identity.assignRole", Identity, Admin),
    IdentityRevokeRole => ("identity.revokeRole", Identity, Admin),
    IdentityGrant => ("identity.grant", Identity, Admin),
    IdentityRevoke => ("identity.revoke", Identity, Admin),
    IdentityListAcl => ("identity.listAcl", Identity, Admin),
    IdentitySetOwner => ("identity.setOwner", Identity, Admin),
    IdentityGetOwner => ("identity.getOwner", Identity, Admin),

    StoreGet => ("store.get", Store, Read),
    StoreAll => ("store.all", Store, Read),
    StoreWhere => ("store.where", Store, Read),
    StoreFindOne => ("store.findOne", Store, Read),
    StoreCount => ("store.count", Store, Read),
    StoreFirst => ("store.first", Store, Read),
    StoreLast => ("store.last", Store, Read),
    StorePaginate => ("store.paginate", Store, Read),
    StoreSum => ("store.sum", Store, Read),
    StoreAvg => ("store.avg", Store, Read),
    StoreMin => ("store.min", Store, Read),
    StoreMax => ("store.max", Store, Read),
    StoreInsert => ("store.insert", Store, Write),
    StoreUpdate => ("store.update", Store, Write),
    StoreDelete => ("store.delete", Store, Write),
    StoreClear => ("store.clear", Store, Write),
    StoreTransaction => ("store.transaction", Store, Write),
    StoreBuckets => ("store.buckets", Store, Read),
    StoreStats => ("store.stats", Store, Read),
    StoreDefineBucket => ("store.defineBucket", Store, Admin),
    StoreDropBucket => ("store.dropBucket", Store, Admin),
    StoreUpdateBucket => ("store.updateBucket", Store, Admin),
    StoreGetBucketSchema => ("store.getBucketSchema", Store, Read),
    StoreDefineQuery => ("store.defineQuery", Store, Admin),
    StoreUndefineQuery => ("store.undefineQuery", Store, Admin),
    StoreListQueries => ("store.listQueries", Store, Read),
    StoreSubscribe => ("store.subscribe", Store, Read),
    StoreUnsubscribe => ("store.unsubscribe", Store, Read),

    RulesEmit => ("rules.emit", Rules, Write),
    RulesEmitCorrelated => ("rules.emitCorrelated", Rules, Write),
    RulesSetFact => ("rules.setFact", Rules, Write),
    RulesGetFact => ("rules.getFact", Rules, Read),
    RulesDeleteFact => ("rules.deleteFact", Rules, Write),
    RulesQueryFacts => ("rules.queryFacts", Rules, Read),
    RulesGetAllFacts => ("rules.getAllFacts", Rules, Read),
    RulesRegister => ("rules.register", Rules, Admin),
    RulesUnregister => ("rules.unregister", Rules, Admin),
    RulesUpdate => ("rules.update", Rules, Admin),
    RulesEnable => ("rules.enable", Rules, Admin),
    RulesDisable => ("rules.disable", Rules, Admin),
    RulesGet => ("rules.get", Rules, Read),
    RulesList => ("rules.list", Rules, Read),
    RulesValidate => ("rules.validate", Rules, Read),
    RulesSubscribe => ("rules.subscribe", Rules, Read),
    RulesUnsubscribe => ("rules.unsubscribe", Rules, Read),
    RulesStats => ("rules.stats", Rules, Read),

    ServerStats => ("server.stats", Server, Admin),
    ServerConnections => ("server.connections", Server, Admin),

    AuditQuery => ("audit.query", Audit, Admin),

    Ping => ("ping", Ping, Read),
}

impl Operation {
    /// Operations admitted without an authenticated session: the login
    /// surface, `whoami` (which reports the unauthenticated state), and
    /// `ping`.  These also bypass the permission check.
    pub fn skips_auth(self) -> bool {
        matches!(
            self,
            Operation::AuthLogin
                | Operation::AuthLogout
                | Operation::IdentityLogin
                | Operation::IdentityLoginWithSecret
                | Operation::IdentityWhoami
                | Operation::Ping
        )
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}
