//! Client-facing middleware

mod auth;

pub use auth::ClientAuth;
