//! Local participant descriptor carried in join requests.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-session participant identifier. Not persisted.
pub type ParticipantId = Uuid;

/// Participant identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub participant_id: ParticipantId,
    pub name: String,
    /// `#rrggbb` color for cursor/selection rendering.
    pub color: String,
}

impl ParticipantInfo {
    /// New participant with a fresh id and a color derived from it.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit id (for testing)
    pub fn with_id(participant_id: ParticipantId, name: impl Into<String>) -> Self {
        Self {
            participant_id,
            name: name.into(),
            color: color_from_id(participant_id),
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }
}

const SATURATION: f32 = 0.7;
const LIGHTNESS: f32 = 0.6;

/// Stable, saturated `#rrggbb` color from an id.
pub fn color_from_id(id: Uuid) -> String {
    let [r, g, b] = rgb_at((id.as_u128() % 360) as f32);
    format!("#{r:02X}{g:02X}{b:02X}")
}

/// RGB bytes for `hue` in degrees, walking the six sectors of the color wheel.
fn rgb_at(hue: f32) -> [u8; 3] {
    let chroma = (1.0 - (2.0 * LIGHTNESS - 1.0).abs()) * SATURATION;
    let sector = hue / 60.0;
    let rising = chroma * (1.0 - (sector % 2.0 - 1.0).abs());
    let (r, g, b) = match sector as u32 {
        0 => (chroma, rising, 0.0),
        1 => (rising, chroma, 0.0),
        2 => (0.0, chroma, rising),
        3 => (0.0, rising, chroma),
        4 => (rising, 0.0, chroma),
        _ => (chroma, 0.0, rising),
    };
    let floor = LIGHTNESS - chroma / 2.0;
    [r, g, b].map(|c| ((c + floor).clamp(0.0, 1.0) * 255.0).round() as u8)
}
