//! One repository module per entity. All functions take the shared
//! [`sqlx::AnyPool`] and return `sqlx::Error` directly; absent lookups are
//! `Ok(None)`, primary-key collisions surface as unique violations, and
//! connection loss is retried by the caller through reconnection.

pub mod cookies;
pub mod http_headers;
pub mod messages;
pub mod portals;
pub mod puppets;
pub mod reactions;
pub mod users;
