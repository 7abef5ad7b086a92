//! Request and response types for the HTTP API.
//!
//! Database records never leave the crate directly; each resource has a response type built
//! `From` its database model, so columns can change without changing the wire format.

pub mod appointments;
pub mod auth;
pub mod credits;
pub mod dashboard;
pub mod design_requests;
pub mod materials;
pub mod orders;
pub mod pagination;
pub mod payments;
pub mod pricing;
pub mod printers;
pub mod settings;
pub mod uploads;
pub mod users;
