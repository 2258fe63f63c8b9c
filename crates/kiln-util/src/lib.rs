#![forbid(unsafe_code)]
//! Hashing, filesystem utilities, and process helpers for kiln.

pub mod error;
pub mod fs;
pub mod hash;
pub mod process;
