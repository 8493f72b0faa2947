// Library entry point for commons-server
// Exposes modules for testing

pub mod api;
pub mod auth;
pub mod events;
pub mod models;
pub mod notify;
pub mod realtime;
pub mod store;
