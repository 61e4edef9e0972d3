//! Persistent store for the forwarding-bot fleet.
//!
//! A thin, typed layer over SQLite. The [`Store`] struct owns the
//! connection and exposes one repository module per entity; multi-row
//! invariants (bot registration, moderation decisions) run inside
//! explicit transactions.

pub mod admins;
pub mod audit;
pub mod blacklist;
pub mod bots;
pub mod db;
pub mod error;
pub mod guests;
pub mod mappings;
pub mod migrations;
pub mod models;
pub mod recipients;
pub mod users;

pub use db::Store;
pub use error::{Result, StoreError};
