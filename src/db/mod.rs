//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: write-side inputs accepted by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules import from `barrel_imagesync::db`; the repository API
//! is re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{ImageLink, NewSpirit};
