//! Positional encodings.

pub mod rope;
