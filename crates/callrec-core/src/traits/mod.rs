//! Collaborator traits consumed by the acquisition engine.

pub mod artifact;
pub mod cache;
pub mod dispatch;
pub mod fetcher;
