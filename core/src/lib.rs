pub mod auth;
pub mod billing;
pub mod chat;
pub mod crisis;
pub mod error;
pub mod risk;
