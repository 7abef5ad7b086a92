//! Database layer for data persistence and access.
//!
//! SQLx over PostgreSQL, organised as one repository per table:
//!
//! ```text
//! ┌─────────────┐
//! │  Handlers   │  (api::handlers - HTTP request handlers)
//! └──────┬──────┘
//!        ↓
//! ┌─────────────┐
//! │ Repositories│  (db::handlers - queries)
//! └──────┬──────┘
//!        ↓
//! ┌─────────────┐
//! │   Models    │  (db::models - database records)
//! └──────┬──────┘
//!        ↓
//! ┌─────────────┐
//! │  PostgreSQL │
//! └─────────────┘
//! ```
//!
//! Repositories borrow a `&mut PgConnection`, so the same code runs against a pooled connection
//! or inside a transaction. Anything that touches more than one row for a single business action
//! (settling a payment, paying with credits) should open a transaction first:
//!
//! ```ignore
//! let mut tx = pool.begin().await?;
//! let order = Orders::new(&mut tx).get_for_update(order_id).await?;
//! Credits::new(&mut tx).create_transaction(&debit).await?;
//! Orders::new(&mut tx).mark_paid(order_id).await?;
//! tx.commit().await?;
//! ```
//!
//! Migrations live in `migrations/` and are run through [`crate::migrator`].

pub mod errors;
pub mod handlers;
pub mod models;
