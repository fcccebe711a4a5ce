//
// lib.rs
//
// Cross-reference engine for folders of linked markdown notes. The binary
// in main.rs wraps it in a language server and a `lint` command.
//

pub mod backend;
pub mod cli;
pub mod completions;
pub mod config;
pub mod events;
pub mod file_source;
pub mod indexer;
pub mod linter;
pub mod location;
pub mod markdown;
pub mod markmark;
pub mod processor;
pub mod references;
pub mod types;
pub mod watcher;
pub mod workqueue;


pub use crate::config::Config;
pub use crate::markmark::Markmark;
