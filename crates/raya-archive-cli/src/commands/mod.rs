//! Subcommand implementations

pub mod dump;
pub mod info;
pub mod load;
pub mod verify;
