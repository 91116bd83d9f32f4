pub mod catalog;
pub mod config;
pub mod connection;
pub mod pipeline;
pub mod protocol;
pub mod session;
