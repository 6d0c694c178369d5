//! Structured logging with component scopes.
//!
//! Provides the per-component log targets and the context prefix used by
//! every stage, plus logger initialisation from configuration.

pub mod init;
pub mod structured;

pub use init::*;
pub use structured::*;
