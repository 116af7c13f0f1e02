//! Delivery coordinator core.
//!
//! A small distributed coordinator layered over a shared Redis store:
//!
//! 1. `Orchestrator::submit` dedups a job and parks it on the background queue
//! 2. queue consumers hand each job to the `Processor`, which emits on the
//!    live channel and/or dispatches push per the job's strategy
//! 3. unconfirmed live emissions become pending-ledger entries
//! 4. the `Sweep` resolves expired entries: confirm, push-fallback, or give up
//! 5. `ConnectionLifecycle` flushes a device's pending entries on reconnect
//!
//! All cross-process coordination goes through TTL-bounded locks and Lua
//! scripts against the shared store; nothing here holds in-process state.

pub mod dedup;
pub mod gateway;
pub mod keys;
pub mod ledger;
pub mod lifecycle;
pub mod lock;
pub mod mutes;
pub mod orchestrator;
pub mod presence;
pub mod processor;
pub mod queue;
pub mod sweep;
