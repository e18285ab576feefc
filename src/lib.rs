//! A round-based composition and evaluation engine for secure multi-party computation (MPC)
//! protocols.
//!
//! In an MPC protocol all parties run the same program and advance in lock-step rounds whenever
//! they need to exchange information. This crate lets protocol code describe such a program as
//! nested sequential, parallel and iterative steps, without managing network rounds by hand, and
//! executes it with as few rounds as the data dependencies allow.
//!
//! ## Main Components
//!
//! * [`builder`]: The [`builder::StepBuilder`] that atomic operations and nested steps are
//!   appended to.
//! * [`chain`]: Fluent step chains (`seq`, `par`, `par_join`, `while_loop`) that unfold as their
//!   inputs become available.
//! * [`deferred`]: Handles on values that only exist once the operations computing them finished.
//! * [`node`]: The lazily materialized tree of schedulable operations.
//! * [`evaluator`]: Drains the tree in batches and runs every batch round by round.
//! * [`network`]: The [`network::Network`] seen by atomic operations and the batching layer that
//!   sends all messages for one party in one round as a single frame.
//! * [`channel`]: The transport underneath the batching layer.
//!
//! Concrete protocol suites plug in by implementing [`operation::NativeOperation`] for their
//! atomic operations, e.g. "open a shared value" or "multiply two shares".
//!
//! ## Example
//!
//! ```
//! use polyflow::{
//!     builder::StepBuilder, config::EvaluatorConfig, pool::BasicResourcePool, simulate::simulate,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), polyflow::Error> {
//! let outputs = simulate(
//!     3,
//!     &EvaluatorConfig::default(),
//!     BasicResourcePool::new,
//!     |b: &mut StepBuilder<BasicResourcePool>| {
//!         b.seq(|b| b.compute(|| 1u64))
//!             .while_loop(|x| *x < 1000, |b, x| b.compute(move || x * 2))
//!             .output()
//!     },
//! )
//! .await?;
//! assert_eq!(outputs, vec![1024; 3]);
//! # Ok(())
//! # }
//! ```
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod builder;
pub mod chain;
pub mod channel;
pub mod config;
pub mod deferred;
pub mod evaluator;
pub mod network;
pub mod node;
pub mod operation;
pub mod pool;
pub mod simulate;

mod error;

pub use error::Error;
