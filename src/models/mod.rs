//! Domain model module declarations.

pub mod call;
pub mod repository;
