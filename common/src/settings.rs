use serde::{Deserialize, Serialize};

pub const ZONES_RANGE: (u32, u32) = (1, 30);
pub const INTENSITY_RANGE: (f64, f64) = (0.0, 1.0);
pub const BLUR_RANGE: (u32, u32) = (0, 50);

/// Persisted player settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub zones_per_side: u32,
    pub intensity: f64,
    pub blur_amount: u32,
    pub autoplay: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            zones_per_side: 10,
            intensity: 1.0,
            blur_amount: 15,
            autoplay: false,
        }
    }
}

impl Settings {
    pub fn clamped(self) -> Self {
        Self {
            zones_per_side: clamp_zones(self.zones_per_side),
            intensity: clamp_intensity(self.intensity),
            blur_amount: clamp_blur(self.blur_amount),
            autoplay: self.autoplay,
        }
    }

    /// Overwrite only the fields present in `patch`.
    pub fn merge(&mut self, patch: &SettingsPatch) {
        if let Some(z) = patch.zones_per_side {
            self.zones_per_side = z;
        }
        if let Some(i) = patch.intensity {
            self.intensity = i;
        }
        if let Some(b) = patch.blur_amount {
            self.blur_amount = b;
        }
        if let Some(a) = patch.autoplay {
            self.autoplay = a;
        }
    }
}

/// A partial settings update. Absent fields stay untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zones_per_side: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blur_amount: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoplay: Option<bool>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        self.zones_per_side.is_none()
            && self.intensity.is_none()
            && self.blur_amount.is_none()
            && self.autoplay.is_none()
    }

    pub fn clamped(self) -> Self {
        Self {
            zones_per_side: self.zones_per_side.map(clamp_zones),
            intensity: self.intensity.map(clamp_intensity),
            blur_amount: self.blur_amount.map(clamp_blur),
            autoplay: self.autoplay,
        }
    }
}

impl From<Settings> for SettingsPatch {
    fn from(s: Settings) -> Self {
        Self {
            zones_per_side: Some(s.zones_per_side),
            intensity: Some(s.intensity),
            blur_amount: Some(s.blur_amount),
            autoplay: Some(s.autoplay),
        }
    }
}

pub fn clamp_zones(z: u32) -> u32 {
    z.clamp(ZONES_RANGE.0, ZONES_RANGE.1)
}

pub fn clamp_intensity(i: f64) -> f64 {
    // NaN collapses to the minimum
    if i.is_nan() {
        return INTENSITY_RANGE.0;
    }
    i.clamp(INTENSITY_RANGE.0, INTENSITY_RANGE.1)
}

pub fn clamp_blur(b: u32) -> u32 {
    b.clamp(BLUR_RANGE.0, BLUR_RANGE.1)
}
