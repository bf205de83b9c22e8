//! tether HTTP server.
//!
//! Wires the credential lifecycle to Postgres and exposes it over HTTP,
//! alongside the bootstrap worker and the health scheduler.

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
