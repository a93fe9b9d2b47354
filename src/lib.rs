//! Tessera core library.
//!
//! Turns declarative descriptions of test sources, tagging rules, and typed
//! transformation commands into a resolved build graph, then serialises that
//! graph as a Ninja build description.

pub mod ast;
pub mod cli;
pub mod filter;
pub mod graph;
pub mod ninja_gen;
pub mod runner;
pub mod tags;
pub mod vars;
