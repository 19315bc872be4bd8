//! Single-producer single-consumer staging queues
//!
//! Every asynchronous boundary in the runtime stages items in one of two
//! queues:
//!
//! - [`RingQueue`]: bounded, lock-free, capacity rounded up to a power of
//!   two. The workhorse behind observe-on, merge inners, zip and the other
//!   prefetching operators.
//! - [`LinkedQueue`]: unbounded, node per item. Used where a true bound is
//!   unnecessary or wrong (buffer-all backpressure, signal serialization,
//!   unicast hand-off).
//!
//! Both are strictly SPSC. Sites that could see multiple producers either
//! funnel them through separate per-producer queues (merge, zip) or
//! serialize offers through the coordinator's drain loop. Both queues also
//! carry the fused-source decoration: a `done` marker published *after* the
//! last item and an error cell, so a consumer that reads `done` before a
//! failed poll knows the stream is finished.

mod linked;
mod ring;

pub(crate) use linked::LinkedQueue;
pub(crate) use ring::RingQueue;
