//! Normalization of artifact paths.

pub mod path;
