//! Backpressure-aware reactive dataflow runtime
//!
//! Composes producers, transformers and consumers of value streams under a
//! pull-based flow-control discipline: a downstream consumer explicitly
//! requests a bounded number of items, upstream stages never deliver more
//! than the outstanding demand, and every chain terminates exactly once
//! (complete or error) or is cancelled.
//!
//! ## Anatomy of a chain
//!
//!```text
//!  range(1,10) ──▶ filter ──▶ observe_on(worker) ──▶ subscriber
//!                               │ bounded SPSC queue
//!                               │ work-in-progress drain
//!```
//!
//! | Layer | Module | What lives there |
//! |-------|--------|------------------|
//! | contract | [`flow`] | `Publisher` / `Subscriber` / `Subscription`, fusion |
//! | primitives | [`flowctl`] | request arithmetic, subscription slot, terminal latch |
//! | queues | `queue` | SPSC bounded ring, SPSC unbounded linked |
//! | scheduling | [`exec`] | workers, immediate/single/computation executors |
//! | operators | `op` | transformers, coordinators, timed, backpressure |
//! | sources | `source` | just/iter/range/defer/using/create/futures |
//! | sharing | [`process`] | processors, serializer, publish/refcount |
//! | bridges | [`blocking`] | iterator and collecting bridges |
//!
//! ## Example
//!
//!```
//! let sum = flusso::range(1, 10)
//!     .filter(|x| x % 2 == 0)
//!     .reduce(|a, b| a + b)
//!     .blocking_last()
//!     .unwrap();
//! assert_eq!(sum, Some(30));
//!```
//!
//! ## Threading
//!
//! No operator blocks by design; only the [`blocking`] bridges do. User
//! callbacks run on whichever thread the signal arrives on — blocking inside
//! a callback stalls that whole pipeline. Within one chain, `next` signals
//! are totally ordered; between chains there is no ordering.

pub mod blocking;
pub mod error;
pub mod exec;
pub mod flow;
pub mod flowctl;
pub mod hooks;
pub mod op;
pub mod process;
pub mod source;

pub(crate) mod queue;
#[cfg(test)]
pub(crate) mod testkit;

pub use blocking::BlockingIter;
pub use error::{CompositeError, FlowError};
pub use flow::{
    Flow, FusedQueue, FusionMode, Link, Publisher, Subscriber, Subscription, Unsubscriber,
    WakeHandle,
};
pub use op::{
    DropHandler, GroupedFlow, amb, combine_latest, combine_latest2, combine_latest3,
    combine_latest4, concat, concat_eager, merge, with_latest_from, zip, zip2, zip3, zip4,
};
pub use process::{ConnectableFlow, DirectProcessor, SerializedSubscriber, UnicastProcessor};
#[cfg(feature = "futures")]
pub use source::from_future;
pub use source::{
    Backpressure, Emitter, create, defer, empty, fail, from_iter, interval, just, never, range,
    timer, using,
};
