//! Client presence record and deterministic name→color derivation.
//!
//! A `Client` is the identity + mutable presence of one connected editor.
//! The session owns every `Client` exclusively; documents only ever see the
//! serialized [`ClientView`] projection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Presence record for one connected editor.
#[derive(Debug, Clone)]
pub struct Client {
    /// Caller-supplied id, unique within a session.
    pub client_id: String,
    /// Display name, mutable via `update-client`.
    pub name: String,
    /// Display color, derived from the name unless the client overrides it.
    pub color: String,
    /// Document id currently joined, or empty. A lookup key into the
    /// session's document registry, not an owning reference; only the
    /// session's join/leave paths mutate it.
    pub location: String,
    /// Last cursor/selection payload, relayed verbatim.
    pub selection: Option<Value>,
}

/// The serialized presence view broadcast to peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientView {
    pub client_id: String,
    pub name: String,
    pub color: String,
    pub location: String,
}

impl Client {
    pub fn new(client_id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        let color = color_for_name(&name);
        Self {
            client_id: client_id.into(),
            name,
            color,
            location: String::new(),
            selection: None,
        }
    }

    /// Pure projection used for every presence broadcast and snapshot.
    pub fn serialize(&self) -> ClientView {
        ClientView {
            client_id: self.client_id.clone(),
            name: self.name.clone(),
            color: self.color.clone(),
            location: self.location.clone(),
        }
    }
}

const HUE_MASK: u32 = 0x100;
// Golden-ratio-derived multiplier spreads adjacent byte sums across the hue wheel.
const HUE_MAGIC: u32 = 161_803_398 / 2 % HUE_MASK;
const SATURATION: f32 = 0.7;
const LIGHTNESS: f32 = 0.5;

/// Derive a stable `#RRGGBB` display color from a display name.
pub fn color_for_name(name: &str) -> String {
    let mut hue = 0u32;
    for byte in name.bytes() {
        hue = (hue + u32::from(byte)) % HUE_MASK;
    }
    hue = (hue * HUE_MAGIC) % HUE_MASK;
    // The scrambled 0-255 value is deliberately normalized over the full
    // hue wheel; scaling it as degrees would leave the 256-360 band of
    // hues unreachable.
    let (r, g, b) = hsl_to_rgb(hue as f32 / HUE_MASK as f32, SATURATION, LIGHTNESS);
    format!(
        "#{:02X}{:02X}{:02X}",
        (r * 255.0) as u8,
        (g * 255.0) as u8,
        (b * 255.0) as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l); // Achromatic
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    let r = hue_to_rgb(p, q, h + 1.0 / 3.0);
    let g = hue_to_rgb(p, q, h);
    let b = hue_to_rgb(p, q, h - 1.0 / 3.0);

    (r, g, b)
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}
