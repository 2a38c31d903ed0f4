//! `eventum` is a minimalistic crate that exposes the building blocks
//! to build Event-sourced applications in Rust.
//!
//! It is organized around two tightly coupled subsystems:
//!
//! * the [Event Store][event::store::Store] contract with optimistic
//!   concurrency, and the [state folding][state] engine built on top of it
//!   through the [`Aggregate`][aggregate::Aggregate] type and its
//!   [`Repository`][aggregate::repository::Repository];
//!
//! * the [Subscription][subscription::Subscription] engine, which delivers
//!   stored Domain Events into handler pipelines through a bounded
//!   [channel worker][worker::ChannelWorker], and tracks progress durably
//!   through [checkpoints][checkpoint] using a gap-tolerant, batched
//!   commit protocol.
//!
//! Concrete backend adapters (relational stores, message brokers, etc.)
//! live outside this crate, implementing the contracts exposed here.
//! In-memory implementations of each contract are included, both as
//! reference implementations and as test doubles.

pub mod aggregate;
pub mod checkpoint;
pub mod command;
pub mod event;
pub mod message;
pub mod serde;
pub mod state;
pub mod stream;
pub mod subscription;
pub mod tracing;
pub mod version;
pub mod worker;

pub use crate::aggregate::Aggregate;
pub use crate::state::State;
pub use crate::stream::StreamName;
pub use crate::version::Version;
