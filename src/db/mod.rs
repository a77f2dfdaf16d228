//! Database module: insert models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: row shapes accepted by repository inserts.
//! - `repo`: SQL-only functions that map rows into domain entities.
//!
//! Callers import from `clinic_bot::db`; the repository API and the insert
//! models are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{NewAppointment, NewInteraction};
