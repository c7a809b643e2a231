//! Core trait abstractions for the pipeline's collaborators.

pub mod llm;
pub mod object_store;
pub mod warehouse;
