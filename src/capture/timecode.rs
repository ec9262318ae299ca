//! Per-frame timecode extraction.

use serde::{Deserialize, Serialize};

use crate::device::InputFrame;

/// Timecode standards a capture device can embed in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimecodeFormat {
    /// Vertical interval timecode, field 1
    Vitc,
    /// Vertical interval timecode, field 2
    VitcField2,
    /// RP188 VITC1
    Rp188Vitc1,
    /// RP188 VITC2
    Rp188Vitc2,
    /// RP188 linear timecode
    Rp188Ltc,
}

impl TimecodeFormat {
    pub const ALL: [TimecodeFormat; 5] = [
        Self::Vitc,
        Self::VitcField2,
        Self::Rp188Vitc1,
        Self::Rp188Vitc2,
        Self::Rp188Ltc,
    ];

    fn slot(self) -> usize {
        match self {
            Self::Vitc => 0,
            Self::VitcField2 => 1,
            Self::Rp188Vitc1 => 2,
            Self::Rp188Vitc2 => 3,
            Self::Rp188Ltc => 4,
        }
    }
}

/// A timecode value as reported by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawTimecode {
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub frames: u8,
    pub drop_frame: bool,
    pub user_bits: u32,
}

impl RawTimecode {
    /// Render as `HH:MM:SS:FF`, with `;` before the frame count for drop-frame.
    pub fn render(&self, out: &mut String) {
        use std::fmt::Write;

        let sep = if self.drop_frame { ';' } else { ':' };
        out.clear();
        let _ = write!(
            out,
            "{:02}:{:02}:{:02}{}{:02}",
            self.hours, self.minutes, self.seconds, sep, self.frames
        );
    }

    pub fn render_user_bits(&self, out: &mut String) {
        use std::fmt::Write;

        out.clear();
        let _ = write!(out, "0x{:08X}", self.user_bits);
    }
}

/// Timecode and user bits for one standard. Empty strings mean absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimecodeEntry {
    pub format: TimecodeFormat,
    pub timecode: String,
    pub user_bits: String,
}

impl TimecodeEntry {
    fn empty(format: TimecodeFormat) -> Self {
        Self {
            format,
            timecode: String::new(),
            user_bits: String::new(),
        }
    }

    pub fn is_present(&self) -> bool {
        !self.timecode.is_empty()
    }
}

/// The full set of timecodes captured alongside one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimecodeBundle {
    entries: [TimecodeEntry; 5],
}

impl Default for TimecodeBundle {
    fn default() -> Self {
        Self {
            entries: TimecodeFormat::ALL.map(TimecodeEntry::empty),
        }
    }
}

impl TimecodeBundle {
    /// Fill every entry from the frame. Existing string capacity is reused.
    pub fn extract_from(&mut self, frame: &dyn InputFrame) {
        for entry in &mut self.entries {
            match frame.timecode(entry.format) {
                Some(raw) => {
                    raw.render(&mut entry.timecode);
                    raw.render_user_bits(&mut entry.user_bits);
                }
                None => {
                    entry.timecode.clear();
                    entry.user_bits.clear();
                }
            }
        }
    }

    pub fn get(&self, format: TimecodeFormat) -> &TimecodeEntry {
        &self.entries[format.slot()]
    }

    pub fn entries(&self) -> &[TimecodeEntry] {
        &self.entries
    }

    /// Copy another bundle into this one, reusing string capacity.
    pub fn copy_from(&mut self, other: &TimecodeBundle) {
        for (dst, src) in self.entries.iter_mut().zip(other.entries.iter()) {
            dst.timecode.clone_from(&src.timecode);
            dst.user_bits.clone_from(&src.user_bits);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.is_present())
    }
}
