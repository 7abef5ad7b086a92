//! HTTP API: request handlers and their request/response types.

pub mod handlers;
pub mod models;
