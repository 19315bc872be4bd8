//! Processors: stages that are subscriber and publisher at once
//!
//! | Type | Shape | Backpressure |
//! |------|-------|--------------|
//! | [`DirectProcessor`] | hot multicast | per-subscriber demand; overflow errors only the slow one |
//! | [`UnicastProcessor`] | single consumer | unbounded staging queue, Async fusion |
//! | [`SerializedSubscriber`] | wrapper | emitter loop serializes concurrent signals |
//! | [`ConnectableFlow`] | publish/refcount | connect-once multicast over a cold source |

mod direct;
mod serialize;
mod share;
mod unicast;

pub use direct::DirectProcessor;
pub use serialize::SerializedSubscriber;
pub use share::ConnectableFlow;
pub use unicast::UnicastProcessor;
