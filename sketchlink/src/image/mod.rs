//! Program images and their paged upload form.

pub mod hex;
pub mod sketch;

pub use hex::{HexOptions, MAX_PROGRAM_SIZE, ProgramImage};
pub use sketch::{Page, Sketch, SketchInfo, paginate};
