//
// cli/mod.rs
//
// One-shot subcommands run instead of the language server
//

pub mod lint;
