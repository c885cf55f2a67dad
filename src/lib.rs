pub mod actors;
pub mod alerts;
pub mod config;
pub mod connection;
pub mod discord;
pub mod error;
pub mod sensors;
pub mod util;
pub mod weather;
