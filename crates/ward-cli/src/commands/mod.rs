pub mod audit;
pub mod common;
pub mod completions;
pub mod enqueue;
pub mod flush;
pub mod list;
pub mod probe;
pub mod queue;
pub mod status;
