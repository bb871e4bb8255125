//! Adapters for the broker, the chat-state cache, the relational store and outbound HTTP.

pub mod broker;
pub mod cache;
pub mod database;
pub mod entities;
pub mod http;
pub mod repositories;
pub mod settings;
pub mod traits;
