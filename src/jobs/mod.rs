//! Run lifecycle shared by evaluation, parameter tuning and prompt tuning.
//!
//! The [`RunStore`] record is authoritative. [`ProgressHub`] keeps an ordered, replayable
//! event log per run, and [`RunView`] rebuilds live state from a snapshot plus events.

pub mod events;
pub mod hub;
pub mod manager;
pub mod run;
pub mod store;
pub mod view;

pub use events::{EventEnvelope, JobEvent};
pub use hub::{ProgressHub, Subscription};
pub use manager::{JobContext, JobManager};
pub use run::{BestPointer, Progress, Run, RunItem, RunKind, RunOutcome, RunStatus};
pub use store::{InMemoryRunStore, RunStore};
pub use view::RunView;
