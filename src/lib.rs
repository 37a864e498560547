#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod arch;
pub mod backend;
pub mod cli;
pub mod config;
pub mod console;
pub mod driver;
pub mod error;
pub mod image;
pub mod logging;
pub mod paths;
pub mod progress;
pub mod recipe;
pub mod util;
