pub mod authorize;
pub mod error;
pub mod ids;
pub mod path;
pub mod permission;
pub mod policy;
pub mod principal;
pub mod task;

pub use error::{AppError, DenyReason, DriverError};
pub use principal::{Principal, PrincipalKind, Role};
