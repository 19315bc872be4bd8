//! Operator catalog
//!
//! Each operator is a product of (upstream flow, parameters, adapter
//! constructor); construction is cheap and all behavior is deferred to
//! attachment. The fluent methods on [`Flow`](crate::flow::Flow) live next
//! to the operator they build.
//!
//! The asynchronous-boundary operators all specialize the queue-drain
//! pattern in [`drain`]; the multi-source coordinators are the distinct
//! state machines of `merge`, `concat`, `concat_eager`, `switch`, `zip`,
//! `combine` and `amb`.

pub(crate) mod drain;

mod amb;
mod backpressure;
pub(crate) mod basic;
mod combine;
mod concat;
mod concat_eager;
mod group_by;
mod merge;
mod observe_on;
mod recover;
mod slice;
mod subscribe_on;
mod switch;
mod time;
mod window;
mod zip;

pub use amb::amb;
pub use backpressure::DropHandler;
pub use combine::{combine_latest, with_latest_from};
pub use concat::concat;
pub use concat_eager::concat_eager;
pub use group_by::GroupedFlow;
pub use merge::merge;
pub use zip::zip;

use crate::flow::Flow;

macro_rules! same_type {
    ($x:ident) => { T };
}

/// Generates fixed-arity typed wrappers over the `Vec`-based coordinators.
macro_rules! define_arity_combiners {
    ($($n:literal => ($($arg:ident),+);)*) => {
        paste::paste! {
            $(
                /// Lockstep combination of a fixed set of same-typed flows.
                pub fn [<zip $n>]<T, R>(
                    $($arg: Flow<T>,)+
                    zipper: impl Fn($(same_type!($arg)),+) -> R + Send + Sync + 'static,
                ) -> Flow<R>
                where
                    T: Send + 'static,
                    R: Send + 'static,
                {
                    zip(vec![$($arg),+], move |mut row: Vec<T>| {
                        let mut it = row.drain(..);
                        zipper($({
                            let _ = stringify!($arg);
                            it.next().expect("row arity")
                        }),+)
                    })
                }

                /// Latest-value combination of a fixed set of same-typed flows.
                pub fn [<combine_latest $n>]<T, R>(
                    $($arg: Flow<T>,)+
                    combiner: impl Fn($(same_type!($arg)),+) -> R + Send + Sync + 'static,
                ) -> Flow<R>
                where
                    T: Clone + Send + 'static,
                    R: Send + 'static,
                {
                    combine_latest(vec![$($arg),+], move |mut row: Vec<T>| {
                        let mut it = row.drain(..);
                        combiner($({
                            let _ = stringify!($arg);
                            it.next().expect("row arity")
                        }),+)
                    })
                }
            )*
        }
    };
}

define_arity_combiners! {
    2 => (a, b);
    3 => (a, b, c);
    4 => (a, b, c, d);
}
