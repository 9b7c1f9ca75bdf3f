//! Tripwire Action
//!
//! Executes a trigger's action chain for one matched event.
//!
//! Node kinds:
//! - `pass`: forward the state, or replace it with a fixed result
//! - `task`: invoke a registered [`TaskHandler`] with retry and timeout
//! - `choice`: run the first branch whose expression holds, else the default
//! - `parallel`: run branches concurrently, failing fast on the first error
//! - `map`: run an iterator chain per item with bounded concurrency
//! - `end`: stop the enclosing chain
//!
//! Completed task steps are recorded in a [`Journal`] so that a re-delivered
//! event resumes instead of invoking the same tasks again.

mod error;
mod events;
mod executor;
mod journal;
mod task;

pub use error::ExecutionError;
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use executor::{ActionExecutor, ExecutorConfig};
pub use journal::{InMemoryJournal, Journal, JournalError, NoopJournal};
pub use task::{EchoTask, FnHandler, LogTask, TaskFailure, TaskHandler, TaskRegistry, TaskRequest};
