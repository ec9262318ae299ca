//! Display mode catalog and the static mode-to-resolution table.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque display mode identifier, a packed four-character code.
///
/// Serialized as its four characters (`"Hp30"`), or as `0x`-prefixed hex
/// when the code is not printable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DisplayModeId(pub u32);

impl DisplayModeId {
    pub const fn from_fourcc(code: &[u8; 4]) -> Self {
        Self(u32::from_be_bytes(*code))
    }

    pub fn fourcc(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    // SD
    pub const NTSC: Self = Self::from_fourcc(b"ntsc");
    pub const NTSC_2398: Self = Self::from_fourcc(b"nt23");
    pub const NTSC_P: Self = Self::from_fourcc(b"ntsp");
    pub const PAL: Self = Self::from_fourcc(b"pal ");
    pub const PAL_P: Self = Self::from_fourcc(b"palp");

    // HD 720
    pub const HD720P50: Self = Self::from_fourcc(b"hp50");
    pub const HD720P5994: Self = Self::from_fourcc(b"hp59");
    pub const HD720P60: Self = Self::from_fourcc(b"hp60");

    // HD 1080
    pub const HD1080P2398: Self = Self::from_fourcc(b"23ps");
    pub const HD1080P24: Self = Self::from_fourcc(b"24ps");
    pub const HD1080P25: Self = Self::from_fourcc(b"Hp25");
    pub const HD1080P2997: Self = Self::from_fourcc(b"Hp29");
    pub const HD1080P30: Self = Self::from_fourcc(b"Hp30");
    pub const HD1080I50: Self = Self::from_fourcc(b"Hi50");
    pub const HD1080I5994: Self = Self::from_fourcc(b"Hi59");
    pub const HD1080I6000: Self = Self::from_fourcc(b"Hi60");
    pub const HD1080P50: Self = Self::from_fourcc(b"Hp50");
    pub const HD1080P5994: Self = Self::from_fourcc(b"Hp59");
    pub const HD1080P6000: Self = Self::from_fourcc(b"Hp60");

    // 2K
    pub const TWO_K_2398: Self = Self::from_fourcc(b"2k23");
    pub const TWO_K_24: Self = Self::from_fourcc(b"2k24");
    pub const TWO_K_25: Self = Self::from_fourcc(b"2k25");
    pub const TWO_K_DCI_2398: Self = Self::from_fourcc(b"2d23");
    pub const TWO_K_DCI_24: Self = Self::from_fourcc(b"2d24");
    pub const TWO_K_DCI_25: Self = Self::from_fourcc(b"2d25");

    // 4K
    pub const UHD4K_2398: Self = Self::from_fourcc(b"4k23");
    pub const UHD4K_24: Self = Self::from_fourcc(b"4k24");
    pub const UHD4K_25: Self = Self::from_fourcc(b"4k25");
    pub const UHD4K_2997: Self = Self::from_fourcc(b"4k29");
    pub const UHD4K_30: Self = Self::from_fourcc(b"4k30");
    pub const FOUR_K_DCI_2398: Self = Self::from_fourcc(b"4d23");
    pub const FOUR_K_DCI_24: Self = Self::from_fourcc(b"4d24");
    pub const FOUR_K_DCI_25: Self = Self::from_fourcc(b"4d25");
}

impl fmt::Display for DisplayModeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.fourcc();
        if code.iter().all(|c| c.is_ascii_graphic() || *c == b' ') {
            write!(f, "'{}'", String::from_utf8_lossy(&code))
        } else {
            write!(f, "{:#010x}", self.0)
        }
    }
}

impl TryFrom<String> for DisplayModeId {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        if let Some(hex) = value.strip_prefix("0x") {
            return u32::from_str_radix(hex, 16)
                .map(Self)
                .map_err(|e| format!("invalid display mode `{}`: {}", value, e));
        }
        let code: [u8; 4] = value
            .as_bytes()
            .try_into()
            .map_err(|_| format!("display mode `{}` is not a four-character code", value))?;
        Ok(Self::from_fourcc(&code))
    }
}

impl From<DisplayModeId> for String {
    fn from(id: DisplayModeId) -> Self {
        let code = id.fourcc();
        if code.iter().all(|c| c.is_ascii_graphic() || *c == b' ') {
            String::from_utf8_lossy(&code).into_owned()
        } else {
            format!("{:#010x}", id.0)
        }
    }
}

/// Frame size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Catalog entry for one display mode. Immutable once enumerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMode {
    pub id: DisplayModeId,
    pub name: String,
    pub resolution: Resolution,
    /// Frame duration in `time_scale` units
    pub frame_duration: i64,
    pub time_scale: i64,
}

impl DisplayMode {
    /// Build the broadcast-standard entry for a known mode id.
    pub fn standard(id: DisplayModeId) -> Option<Self> {
        STANDARD_MODES
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| Self {
                id,
                name: entry.name.to_string(),
                resolution: entry.resolution,
                frame_duration: entry.frame_duration,
                time_scale: entry.time_scale,
            })
    }

    /// Every broadcast-standard mode in table order.
    pub fn all_standard() -> Vec<Self> {
        STANDARD_MODES
            .iter()
            .filter_map(|entry| Self::standard(entry.id))
            .collect()
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    /// Whole frames per second, rounded up (29.97 reports 30).
    pub fn fps(&self) -> u32 {
        if self.frame_duration <= 0 {
            return 0;
        }
        ((self.time_scale + (self.frame_duration - 1)) / self.frame_duration) as u32
    }
}

struct StandardMode {
    id: DisplayModeId,
    name: &'static str,
    resolution: Resolution,
    frame_duration: i64,
    time_scale: i64,
}

const fn mode(
    id: DisplayModeId,
    name: &'static str,
    width: u32,
    height: u32,
    frame_duration: i64,
    time_scale: i64,
) -> StandardMode {
    StandardMode {
        id,
        name,
        resolution: Resolution::new(width, height),
        frame_duration,
        time_scale,
    }
}

type Id = DisplayModeId;

const STANDARD_MODES: &[StandardMode] = &[
    mode(Id::NTSC, "NTSC", 720, 486, 1001, 30000),
    mode(Id::NTSC_2398, "NTSC 23.98", 720, 486, 1001, 24000),
    mode(Id::NTSC_P, "NTSC Progressive", 720, 486, 1001, 60000),
    mode(Id::PAL, "PAL", 720, 576, 1000, 25000),
    mode(Id::PAL_P, "PAL Progressive", 720, 576, 1000, 50000),
    mode(Id::HD720P50, "HD 720p 50", 1280, 720, 1000, 50000),
    mode(Id::HD720P5994, "HD 720p 59.94", 1280, 720, 1001, 60000),
    mode(Id::HD720P60, "HD 720p 60", 1280, 720, 1000, 60000),
    mode(Id::HD1080P2398, "HD 1080p 23.98", 1920, 1080, 1001, 24000),
    mode(Id::HD1080P24, "HD 1080p 24", 1920, 1080, 1000, 24000),
    mode(Id::HD1080P25, "HD 1080p 25", 1920, 1080, 1000, 25000),
    mode(Id::HD1080P2997, "HD 1080p 29.97", 1920, 1080, 1001, 30000),
    mode(Id::HD1080P30, "HD 1080p 30", 1920, 1080, 1000, 30000),
    mode(Id::HD1080I50, "HD 1080i 50", 1920, 1080, 1000, 25000),
    mode(Id::HD1080I5994, "HD 1080i 59.94", 1920, 1080, 1001, 30000),
    mode(Id::HD1080I6000, "HD 1080i 60", 1920, 1080, 1000, 30000),
    mode(Id::HD1080P50, "HD 1080p 50", 1920, 1080, 1000, 50000),
    mode(Id::HD1080P5994, "HD 1080p 59.94", 1920, 1080, 1001, 60000),
    mode(Id::HD1080P6000, "HD 1080p 60", 1920, 1080, 1000, 60000),
    mode(Id::TWO_K_2398, "2K 23.98", 2048, 1556, 1001, 24000),
    mode(Id::TWO_K_24, "2K 24", 2048, 1556, 1000, 24000),
    mode(Id::TWO_K_25, "2K 25", 2048, 1556, 1000, 25000),
    mode(Id::TWO_K_DCI_2398, "2K DCI 23.98", 2048, 1080, 1001, 24000),
    mode(Id::TWO_K_DCI_24, "2K DCI 24", 2048, 1080, 1000, 24000),
    mode(Id::TWO_K_DCI_25, "2K DCI 25", 2048, 1080, 1000, 25000),
    mode(Id::UHD4K_2398, "4K 2160p 23.98", 3840, 2160, 1001, 24000),
    mode(Id::UHD4K_24, "4K 2160p 24", 3840, 2160, 1000, 24000),
    mode(Id::UHD4K_25, "4K 2160p 25", 3840, 2160, 1000, 25000),
    mode(Id::UHD4K_2997, "4K 2160p 29.97", 3840, 2160, 1001, 30000),
    mode(Id::UHD4K_30, "4K 2160p 30", 3840, 2160, 1000, 30000),
    mode(Id::FOUR_K_DCI_2398, "4K DCI 23.98", 4096, 2160, 1001, 24000),
    mode(Id::FOUR_K_DCI_24, "4K DCI 24", 4096, 2160, 1000, 24000),
    mode(Id::FOUR_K_DCI_25, "4K DCI 25", 4096, 2160, 1000, 25000),
];

static RESOLUTIONS: Lazy<HashMap<DisplayModeId, Resolution>> = Lazy::new(|| {
    STANDARD_MODES
        .iter()
        .map(|entry| (entry.id, entry.resolution))
        .collect()
});

/// Look up the frame size of a known broadcast mode.
pub fn resolution_of(id: DisplayModeId) -> Option<Resolution> {
    RESOLUTIONS.get(&id).copied()
}

/// Display modes a device interface reported, enumerated once.
#[derive(Debug, Clone, Default)]
pub struct ModeCatalog {
    modes: Vec<DisplayMode>,
}

impl ModeCatalog {
    pub fn new(modes: Vec<DisplayMode>) -> Self {
        Self { modes }
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    pub fn modes(&self) -> &[DisplayMode] {
        &self.modes
    }

    /// First mode whose id matches exactly.
    pub fn find(&self, id: DisplayModeId) -> Option<&DisplayMode> {
        self.modes.iter().find(|m| m.id == id)
    }

    pub fn get(&self, id: DisplayModeId) -> Result<&DisplayMode> {
        self.find(id).ok_or(Error::ModeNotFound(id))
    }

    /// Validate a user-supplied index against the catalog bounds.
    pub fn by_index(&self, index: i64) -> Result<&DisplayMode> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.modes.get(i))
            .ok_or(Error::InvalidModeIndex {
                index,
                len: self.modes.len(),
            })
    }

    /// Human-readable names in catalog order, for mode pickers.
    pub fn names(&self) -> Vec<String> {
        self.modes
            .iter()
            .map(|m| {
                if m.name.is_empty() {
                    "Unknown mode".to_string()
                } else {
                    m.name.clone()
                }
            })
            .collect()
    }

    /// Frame size for a mode, preferring the static table over the catalog.
    pub fn resolution(&self, id: DisplayModeId) -> Option<Resolution> {
        resolution_of(id).or_else(|| self.find(id).map(|m| m.resolution))
    }
}
