pub mod scheduler;
pub mod snapshot;
pub mod source;
pub mod tracker;


pub use scheduler::Scheduler;
pub use snapshot::{SnapshotStore, SubredditSnapshot};
pub use source::{MetricsSink, SubredditSource, SubscriptionSource};
pub use tracker::{
    compute_deltas, union_recent_posts, ActivityReport, ActivityTracker, CycleOutcome,
    PersistPolicy,
};
