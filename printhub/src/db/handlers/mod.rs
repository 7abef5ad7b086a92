//! Repository implementations for database access.
//!
//! - [`Users`], [`Materials`], [`Printers`]: implement the CRUD [`Repository`] trait
//! - [`Orders`], [`Payments`], [`Credits`], [`Appointments`], [`DesignRequests`]: lifecycle tables
//!   with purpose-built methods (row locking, conditional transitions)
//! - [`Files`]: upload metadata
//! - [`Settings`]: JSON key/value store, including the typed shop settings
//! - [`PasswordResetTokens`]: reset token lifecycle

pub mod appointments;
pub mod credits;
pub mod design_requests;
pub mod files;
pub mod materials;
pub mod orders;
pub mod password_reset_tokens;
pub mod payments;
pub mod printers;
pub mod repository;
pub mod settings;
pub mod users;

pub use appointments::Appointments;
pub use credits::Credits;
pub use design_requests::DesignRequests;
pub use files::Files;
pub use materials::Materials;
pub use orders::Orders;
pub use password_reset_tokens::PasswordResetTokens;
pub use payments::Payments;
pub use printers::Printers;
pub use repository::Repository;
pub use settings::Settings;
pub use users::Users;
