//! Database record types, one module per table.

pub mod appointments;
pub mod credits;
pub mod design_requests;
pub mod files;
pub mod materials;
pub mod orders;
pub mod password_reset_tokens;
pub mod payments;
pub mod printers;
pub mod settings;
pub mod users;
