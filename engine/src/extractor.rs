use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use ambilight_common::frame::{Frame, Rgb, ZoneColorSet};
use ambilight_common::settings::{self, Settings, SettingsPatch};
use tracing::debug;

/// Share of the perpendicular dimension covered by each border band.
const BAND_FRACTION: f64 = 0.05;

/// Border-color extraction.
///
/// Algorithm:
/// 1. Band thickness is 5% of the perpendicular dimension, at least 1 pixel.
/// 2. Four bands are cut: top/bottom rows, left/right columns. Corner pixels
///    belong to two bands and are counted in both.
/// 3. Each band is split into `zones_per_side` contiguous zones along its
///    long axis (see [`zone_bounds`]).
/// 4. A zone's color is the per-channel mean of its pixels, truncated.
/// 5. Below full intensity every channel is scaled down, truncated.
///
/// Output colors are RGB even though frames are stored BGR.
pub fn extract(frame: &Frame, zones_per_side: u32, intensity: f64) -> ZoneColorSet {
    let (width, height) = (frame.width(), frame.height());
    let vband = band_thickness(height);
    let hband = band_thickness(width);
    let zones = zones_per_side.max(1) as usize;

    let top_rows = 0..vband;
    let bottom_rows = height - vband..height;
    let left_cols = 0..hband;
    let right_cols = width - hband..width;

    let horizontal = zone_bounds(width, zones);
    let vertical = zone_bounds(height, zones);

    let mut set = ZoneColorSet {
        top: horizontal
            .iter()
            .map(|xs| region_mean(frame, xs.clone(), top_rows.clone()))
            .collect(),
        right: vertical
            .iter()
            .map(|ys| region_mean(frame, right_cols.clone(), ys.clone()))
            .collect(),
        bottom: horizontal
            .iter()
            .map(|xs| region_mean(frame, xs.clone(), bottom_rows.clone()))
            .collect(),
        left: vertical
            .iter()
            .map(|ys| region_mean(frame, left_cols.clone(), ys.clone()))
            .collect(),
    };

    if intensity < 1.0 {
        for zone in set
            .top
            .iter_mut()
            .chain(set.right.iter_mut())
            .chain(set.bottom.iter_mut())
            .chain(set.left.iter_mut())
        {
            *zone = scale(*zone, intensity);
        }
    }

    set
}

/// Band thickness for a frame dimension: `max(1, round(dim * 0.05))`.
pub fn band_thickness(dim: usize) -> usize {
    let band = (dim as f64 * BAND_FRACTION).round() as usize;
    band.max(1).min(dim.max(1))
}

/// Split `[0, len)` into `zones` contiguous ranges.
///
/// Every zone but the last is `floor(len / zones)` long; the last absorbs the
/// remainder, so for `len >= zones` the ranges partition `[0, len)` exactly.
/// When `len < zones` each zone is clamped to one pixel and trailing zones
/// all land on the final pixel, so no zone is ever empty.
pub fn zone_bounds(len: usize, zones: usize) -> Vec<Range<usize>> {
    let zones = zones.max(1);
    if len == 0 {
        return vec![0..0; zones];
    }
    let size = (len / zones).max(1);
    (0..zones)
        .map(|i| {
            let start = (i * size).min(len - 1);
            let end = if i + 1 == zones {
                len
            } else {
                (start + size).min(len)
            };
            start..end
        })
        .collect()
}

/// Truncated per-channel mean of the region `xs x ys`, returned as RGB.
fn region_mean(frame: &Frame, xs: Range<usize>, ys: Range<usize>) -> Rgb {
    let count = (xs.len() * ys.len()) as u64;
    if count == 0 {
        return [0, 0, 0];
    }
    let mut sum = [0u64; 3];
    for y in ys {
        let row = frame.row(y);
        for px in row[xs.start * 3..xs.end * 3].chunks_exact(3) {
            sum[0] += px[0] as u64;
            sum[1] += px[1] as u64;
            sum[2] += px[2] as u64;
        }
    }
    // BGR sums -> RGB
    [
        (sum[2] / count) as u8,
        (sum[1] / count) as u8,
        (sum[0] / count) as u8,
    ]
}

fn scale(rgb: Rgb, intensity: f64) -> Rgb {
    let factor = intensity.max(0.0);
    rgb.map(|c| (c as f64 * factor) as u8)
}

/// Values the extractor reads for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractorSettings {
    pub zones_per_side: u32,
    pub intensity: f64,
    pub blur_amount: u32,
}

impl ExtractorSettings {
    pub fn extract(&self, frame: &Frame) -> ZoneColorSet {
        extract(frame, self.zones_per_side, self.intensity)
    }
}

/// Process-wide extractor configuration.
///
/// Every running session reads it once per processed frame and any
/// connection may update it. Fields are independent atomics: a frame may
/// see a mix of values from just before and just after an update.
#[derive(Debug)]
pub struct ExtractorConfig {
    zones_per_side: AtomicU32,
    /// f64 bit pattern
    intensity: AtomicU64,
    blur_amount: AtomicU32,
}

impl ExtractorConfig {
    pub fn new(settings: &Settings) -> Self {
        let s = settings.clamped();
        Self {
            zones_per_side: AtomicU32::new(s.zones_per_side),
            intensity: AtomicU64::new(s.intensity.to_bits()),
            blur_amount: AtomicU32::new(s.blur_amount),
        }
    }

    pub fn snapshot(&self) -> ExtractorSettings {
        ExtractorSettings {
            zones_per_side: self.zones_per_side.load(Ordering::Relaxed),
            intensity: f64::from_bits(self.intensity.load(Ordering::Relaxed)),
            blur_amount: self.blur_amount.load(Ordering::Relaxed),
        }
    }

    pub fn set_zones_per_side(&self, zones: u32) {
        self.zones_per_side
            .store(settings::clamp_zones(zones), Ordering::Relaxed);
    }

    pub fn set_intensity(&self, intensity: f64) {
        self.intensity.store(
            settings::clamp_intensity(intensity).to_bits(),
            Ordering::Relaxed,
        );
    }

    pub fn set_blur_amount(&self, blur: u32) {
        self.blur_amount
            .store(settings::clamp_blur(blur), Ordering::Relaxed);
    }

    pub fn apply_settings(&self, settings: &Settings) {
        self.apply_patch(&SettingsPatch::from(*settings));
    }

    /// Apply the present fields of `patch`, clamped to their valid ranges.
    pub fn apply_patch(&self, patch: &SettingsPatch) {
        if let Some(z) = patch.zones_per_side {
            self.set_zones_per_side(z);
        }
        if let Some(i) = patch.intensity {
            self.set_intensity(i);
        }
        if let Some(b) = patch.blur_amount {
            self.set_blur_amount(b);
        }
        debug!(settings = ?self.snapshot(), "extractor configuration updated");
    }
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self::new(&Settings::default())
    }
}
