pub mod auth;
pub mod health;
pub use self::health::health;
