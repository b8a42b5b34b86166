//! Process-level helpers shared by the stage binaries.

pub mod bootstrap;
