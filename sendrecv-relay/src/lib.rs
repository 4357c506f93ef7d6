pub mod config;
pub mod connection;
pub mod registry;
pub mod server;
