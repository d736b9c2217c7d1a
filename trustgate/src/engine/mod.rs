pub mod dispatcher;
pub mod guard;
pub mod policy;

pub use dispatcher::Dispatcher;
pub use guard::SharingGuard;
pub use policy::{PolicyDecision, PolicyEnforcer};
