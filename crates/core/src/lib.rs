//! Domain types shared by the orchestration engine and its front ends.

pub mod domain;
pub mod error;

pub use domain::*;
pub use error::CoreError;
