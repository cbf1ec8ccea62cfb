pub mod engine;
pub mod session;

pub use engine::{PlaybackControl, PlaybackEngine};
pub use session::{PlaybackEvent, PlaybackEventType, PlaybackSession, PlaybackState};
