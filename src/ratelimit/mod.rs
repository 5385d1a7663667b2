//! Sliding-window rate limiting and state management.

mod clock;
mod decision;
mod ledger;
mod limiter;
mod policies;
mod policy;
mod reclaimer;
mod registry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::Decision;
pub use ledger::VisitorLedger;
pub use limiter::SlidingWindowLimiter;
pub use policies::PolicySet;
pub use policy::{Policy, TimeUnit};
pub use reclaimer::Reclaimer;
pub use registry::Registry;
