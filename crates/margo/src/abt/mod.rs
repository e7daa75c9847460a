//! The ULT library capability set, implemented in-crate.
//!
//! Pools, execution streams, and ULTs are modeled as `futures` tasks
//! scheduled over `crossbeam-channel` queues rather than bound to an
//! external fiber library — see DESIGN.md for the rationale. A "ULT"
//! here is a boxed `Future<Output = ()>`; suspension happens the
//! ordinary async way, by `.await`ing an [`sync::Eventual`].

pub mod pool;
pub mod stream;
pub mod substrate;
pub mod sync;
pub mod ult;

pub use pool::{AccessClass, Pool, PoolKind};
pub use stream::ExecutionStream;
pub use substrate::{ArgobotsSubstrate, SubstrateError};
pub use sync::Eventual;
pub use ult::{spawn, yield_now, JoinHandle, Ult};
