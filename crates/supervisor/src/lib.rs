//! `polyglot` — the node server supervisor binary's building blocks.

pub mod bootstrap;
pub mod cli;
pub mod controller;
