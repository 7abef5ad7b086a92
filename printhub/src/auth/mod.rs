//! Authentication and authorization.
//!
//! Customers and staff sign in with email and password. A successful login issues a JWT session
//! token, set as an HttpOnly cookie and also accepted as `Authorization: Bearer <token>` for
//! non-browser clients. Tokens carry the user's roles; `/api/auth/refresh` re-reads them from the
//! database so role changes apply without a fresh login.
//!
//! # Modules
//!
//! - [`current_user`]: `CurrentUser` and [`current_user::MaybeUser`] extractors
//! - [`password`]: Argon2id hashing and password rules
//! - [`permissions`]: role to `(Resource, Operation)` mapping and checks
//! - [`session`]: token creation, verification and cookies
//!
//! # Usage in Handlers
//!
//! ```ignore
//! async fn get_order(
//!     State(state): State<AppState>,
//!     current_user: CurrentUser,
//!     Path(id): Path<OrderId>,
//! ) -> Result<Json<OrderResponse>> {
//!     let order = load(&state.db, id).await?;
//!     permissions::require_access(&current_user, Resource::Orders, Operation::ReadOwn, order.user_id)?;
//!     Ok(Json(order.into()))
//! }
//! ```

pub mod current_user;
pub mod password;
pub mod permissions;
pub mod session;
