pub mod trackable;
pub mod tracker;

pub use trackable::{Trackable, TrackableEvent, TrackableState};
pub use tracker::{TrackOutcome, TrackResult, Tracker};
