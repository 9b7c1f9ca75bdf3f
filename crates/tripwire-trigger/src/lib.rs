//! Tripwire Trigger
//!
//! This crate contains the serializable types shared by every part of tripwire:
//! triggers and their conditions, action chains, inbound events and the
//! workflow instance record produced by executing a chain.
//!
//! Triggers are submitted as [`TriggerDef`] (the id may be missing for
//! transient triggers) and persisted as [`Trigger`] once an id is settled.
//!
//! ```json
//! {
//!   "trigger_id": "large-orders",
//!   "transient": false,
//!   "condition": { "kind": "event-match", "source": "orders", "filter": { "status": "paid" } },
//!   "action_chain": [
//!     { "type": "task", "task": "notify" },
//!     { "type": "end" }
//!   ],
//!   "context": { "threshold": 100 }
//! }
//! ```

mod action;
mod event;
mod instance;
mod trigger;

pub use action::{
  Action, ActionChain, ChoiceAction, ChoiceBranch, MapAction, ParallelAction, RetryBackoff,
  RetryPolicy, TaskAction,
};
pub use event::{Event, Position};
pub use instance::{ElementFailure, InstanceStatus, InvalidTransition, WorkflowInstance};
pub use trigger::{Condition, Trigger, TriggerDef};
