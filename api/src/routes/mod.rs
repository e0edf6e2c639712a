pub mod chat;
pub mod entitlement;
pub mod health;
pub mod webhooks;
