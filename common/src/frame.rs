use serde::{Deserialize, Serialize};

/// One RGB color sample, each channel in `0..=255`.
pub type Rgb = [u8; 3];

const CHANNELS: usize = 3;

/// A decoded video frame.
///
/// Pixels are stored row-major in BGR channel order, which is what the ffmpeg
/// `bgr24` pixel format produces:
///
///   [row 0: B G R B G R ...][row 1: ...]...
///
/// A frame always has non-zero dimensions and exactly `width * height * 3`
/// bytes of pixel data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl Frame {
    /// Wrap a raw BGR buffer.
    pub fn from_bgr(width: usize, height: usize, data: Vec<u8>) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::EmptyDimensions { width, height });
        }
        let expected = width * height * CHANNELS;
        if data.len() != expected {
            return Err(FrameError::BufferSize {
                got: data.len(),
                expected,
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Convert an RGB image (as decoded by the `image` crate) to a BGR frame.
    pub fn from_rgb_image(img: &image::RgbImage) -> Result<Self, FrameError> {
        let (width, height) = (img.width() as usize, img.height() as usize);
        let mut data = Vec::with_capacity(width * height * CHANNELS);
        for pixel in img.pixels() {
            let [r, g, b] = pixel.0;
            data.extend_from_slice(&[b, g, r]);
        }
        Self::from_bgr(width, height, data)
    }

    /// A frame where every pixel has the same RGB color.
    pub fn filled(width: usize, height: usize, rgb: Rgb) -> Result<Self, FrameError> {
        let [r, g, b] = rgb;
        let data = [b, g, r].repeat(width * height);
        Self::from_bgr(width, height, data)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// BGR bytes of a single row.
    pub fn row(&self, y: usize) -> &[u8] {
        let stride = self.width * CHANNELS;
        &self.data[y * stride..(y + 1) * stride]
    }

    /// Pixel at (x, y) as `[b, g, r]`.
    pub fn bgr_at(&self, x: usize, y: usize) -> [u8; 3] {
        let i = (y * self.width + x) * CHANNELS;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// Paint the rectangle `[x0, x1) x [y0, y1)` with an RGB color.
    /// Coordinates are clipped to the frame.
    pub fn fill_rect(&mut self, x0: usize, y0: usize, x1: usize, y1: usize, rgb: Rgb) {
        let [r, g, b] = rgb;
        let (x1, y1) = (x1.min(self.width), y1.min(self.height));
        for y in y0..y1 {
            for x in x0..x1 {
                let i = (y * self.width + x) * CHANNELS;
                self.data[i..i + CHANNELS].copy_from_slice(&[b, g, r]);
            }
        }
    }
}

/// Average border colors for one frame.
///
/// Zones along `top`/`bottom` run left-to-right, zones along `left`/`right`
/// run top-to-bottom. Clients interpolate between consecutive sets, so this
/// ordering must stay stable from frame to frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneColorSet {
    pub top: Vec<Rgb>,
    pub right: Vec<Rgb>,
    pub bottom: Vec<Rgb>,
    pub left: Vec<Rgb>,
}

impl ZoneColorSet {
    /// Iterate all four sides in wire order.
    pub fn sides(&self) -> [(&'static str, &[Rgb]); 4] {
        [
            ("top", &self.top),
            ("right", &self.right),
            ("bottom", &self.bottom),
            ("left", &self.left),
        ]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame has empty dimensions {width}x{height}")]
    EmptyDimensions { width: usize, height: usize },
    #[error("frame buffer has {got} bytes, expected {expected}")]
    BufferSize { got: usize, expected: usize },
}
