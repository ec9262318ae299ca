pub mod slot;
pub mod surface;

pub use slot::{FrameSlot, SlotStats};
pub use surface::{SubmitRejection, SurfaceSlot};
