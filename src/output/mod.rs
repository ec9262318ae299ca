pub mod channel;

pub use channel::{OutputChannel, OutputState, OutputStats, PlaybackTiming, PREROLL_FRAMES};
