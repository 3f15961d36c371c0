//! # lima-linkedin
//!
//! An unofficial async client for LinkedIn's private (Voyager) messaging API.
//!
//! The API surface is reverse-engineered and versioned only by the
//! `x-restli-protocol-version` header, so every deserializer here tolerates
//! unknown fields and treats absent optional fields as data, not errors.

pub mod client;
pub mod error;
pub mod realtime;
pub mod types;
pub mod urn;

pub use client::LinkedInClient;
pub use error::ClientError;
pub use realtime::StreamEvent;
pub use urn::Urn;
