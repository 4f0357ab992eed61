//! # callrec-entity
//!
//! Domain entity models for the Callrec recording acquisition engine.

pub mod download;
