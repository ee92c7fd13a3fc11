//! The async substrate: reference-counted promise/future pairs with
//! subscription and advisory cancellation, invokers (FIFO execution queues
//! bound to a thread or pool), and async semaphores.
//!
//! Cooperative tasks ("fibers") are tokio tasks; every `.await` is an explicit
//! suspension point. Within one [`SerialInvoker`] queued work is strictly
//! serialized, which is the discipline replicated state machines run under.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod invoker;
mod promise;
mod semaphore;

pub use invoker::*;
pub use promise::*;
pub use semaphore::*;
