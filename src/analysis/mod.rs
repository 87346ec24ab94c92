//! Commit analysis: prompt assembly, text generation and the tolerant
//! response extractor.

pub mod extract;
pub mod generator;
pub mod models;
pub mod normalize;
pub mod partial;
pub mod prompt;
pub mod repair;
