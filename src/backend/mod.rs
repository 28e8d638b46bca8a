//! Concrete collaborators: an in-process backend and the hosted REST one.

pub mod firebase;
pub mod memory;
