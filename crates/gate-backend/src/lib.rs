// gate-backend: in-memory reference implementations of the collaborator
// interfaces.  These back the default binary and the integration suites;
// production deployments substitute their own engines behind the traits.

pub mod identity;
pub mod rules;
pub mod store;

pub use identity::{IdentityOptions, MemoryIdentity};
pub use rules::MemoryRules;
pub use store::MemoryStore;
