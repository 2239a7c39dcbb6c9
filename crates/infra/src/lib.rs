pub mod chat_client;
pub mod config;
pub mod db;
pub mod logging;
pub mod stores;
