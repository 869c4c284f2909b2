//! Baton CLI library: command implementations shared by the `baton` binary
//! and its integration tests.

pub mod commands;
