//! Per-region mark bitmaps.

pub mod bitmap;

pub use bitmap::MarkBitmap;
