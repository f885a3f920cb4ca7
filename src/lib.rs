//! Real-time collaboration service for flow documents: rooms with cross-instance
//! fan-out, presence, and last-write-wins document state persisted in the background.

pub mod app;
pub mod auth;
pub mod config;
pub mod db;
pub mod docs;
pub mod error;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod validation;
pub mod websocket;
pub mod ws;
