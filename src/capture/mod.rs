pub mod channel;
pub mod convert;
pub mod frame;
pub mod timecode;

pub use channel::{CaptureChannel, CaptureState, CaptureStats};
pub use convert::{FrameView, PixelConverter, SoftwareConverter};
pub use frame::{Frame, PixelFormat};
pub use timecode::{RawTimecode, TimecodeBundle, TimecodeEntry, TimecodeFormat};
