pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod delivery;
pub mod error;
pub mod handlers;
pub mod models;
pub mod offline_queue;
pub mod pipeline;
pub mod presence;
pub mod push;
pub mod repository;
pub mod router;
pub mod state;
pub mod websocket;
