//! Authorization and publish collaborators
//!
//! Permission decisions and message validation live outside the broker; it
//! only needs a yes/no answer with a reason it can map to an error code.

pub mod permission;
pub mod publisher;

pub use permission::{AllowAll, Operation, PermissionChecker, StaticPermissions};
pub use publisher::{NetworkPublisher, Publisher};
