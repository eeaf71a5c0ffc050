//! Cooperative flow primitives for strand.
//!
//! This crate provides the suspension points every strand coroutine is built
//! from. Each blocking operation takes an [`Interruptor`] and returns a
//! distinguishable error when it fires instead of blocking forever.
//!
//! - **Interruptors**: composite cancellation, woken by the first of N signals.
//! - **FIFO ordering**: a token source and sink pair that admits operations in
//!   the order their tokens were issued.
//! - **Admission tickets**: a credit counter bounding outstanding requests,
//!   with waiters served in arrival order.
//! - **Drain locks**: keep-alive tokens handed to in-flight tasks so teardown
//!   can wait for them.
//!
//! # Architecture
//!
//! ```text
//!  caller ──► FifoSink::enter ──► TicketPool::acquire ──► send ──► FifoExit::end
//!                 (order)             (admission)                   (next token)
//! ```
//!
//! # Example
//!
//! ```rust
//! use strand_flow::{FifoSource, Interruptor};
//!
//! # tokio_test_block_on(async {
//! let source = FifoSource::new();
//! let sink = source.sink();
//!
//! let first = source.new_write_token();
//! let exit = sink.enter(first, &Interruptor::never()).await.unwrap();
//! exit.end();
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod drain;
pub mod error;
pub mod fifo;
pub mod interruptor;
pub mod ticket;

pub use drain::{DrainLock, DrainToken};
pub use error::{FlowError, FlowResult, Interrupted};
pub use fifo::{FifoExit, FifoSink, FifoSource, OrderToken, ReadToken, WriteToken};
pub use interruptor::Interruptor;
pub use ticket::{Ticket, TicketPool, TicketPoolStats};
pub use tokio_util::sync::CancellationToken;
