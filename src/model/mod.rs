//! Records shared by the credential core, the stores and the HTTP layer.

pub mod device;
pub mod role;
pub mod session;
pub mod user;

pub use device::{DeviceInfo, DeviceType, LocationInfo};
pub use role::{system_permissions, Permission, Role, RolePermission, UserRole};
pub use session::{IssuedSession, LoginMethod, Session, SessionStatus};
pub use user::{User, UserStatus, VerificationToken};
