//! Pipeline plumbing: the stage trait, session context, failure
//! containment and assembly of complete pipelines.

pub mod builder;
pub mod context;
pub mod guard;
pub mod stage;

pub use builder::TracePipeline;
pub use context::{Flow, SessionContext, ShellKey};
pub use guard::guarded;
pub use stage::{consumer_fn, Consumer, Discard, FnConsumer};
