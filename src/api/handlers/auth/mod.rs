pub mod password;
pub mod registration;
pub mod session;
pub mod types;

pub use password::{request_password_reset, reset_password};
pub use registration::{register, resend_verification, verify_email};
pub use session::{login, logout, logout_all, me, refresh};

#[cfg(test)]
mod tests;
