//! Configuration parsing for the demo harness
//!
//! This module handles parsing of INI-style accounts files.

mod parser;

pub use parser::{AccountConfig, HarnessConfig};
