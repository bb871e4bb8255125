//! Chat identity resolution, delivery dispatch and consumer supervision.

pub mod chat_store;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod payloads;
pub mod supervisor;
pub mod traits;
