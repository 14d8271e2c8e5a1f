pub mod agent;
pub mod config;
pub mod dispatch;
pub mod identity;
pub mod poll;
pub mod registry;
pub mod server;
