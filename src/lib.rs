pub mod config;
pub mod db;
pub mod events;
pub mod log;
pub mod server;
pub mod services;
pub mod span;
pub mod websocket;
