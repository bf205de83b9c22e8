//! Postgres persistence for the credential lifecycle.
//!
//! The schema lives in `migrations/` and is applied at startup.

mod rows;
mod store;

pub use store::PgStore;
