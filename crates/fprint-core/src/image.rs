//! Grayscale fingerprint image container.

use bitflags::bitflags;

bitflags! {
    /// Orientation and form flags attached to an image.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ImageFlags: u8 {
        const V_FLIPPED = 1 << 0;
        const H_FLIPPED = 1 << 1;
        const COLORS_INVERTED = 1 << 2;
        const BINARIZED = 1 << 3;
        /// Capture depth is indeterminate (swipe sensors).
        const PARTIAL = 1 << 4;

        const STANDARDIZATION = Self::V_FLIPPED.bits()
            | Self::H_FLIPPED.bits()
            | Self::COLORS_INVERTED.bits();
    }
}

/// 8-bit grayscale image, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
    pub flags: ImageFlags,
}

impl Image {
    /// Zero-filled image of the given dimensions.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height],
            flags: ImageFlags::empty(),
        }
    }

    pub fn from_data(width: usize, height: usize, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            data,
            flags: ImageFlags::empty(),
        }
    }

    pub fn with_flags(mut self, flags: ImageFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Non-empty and `width * height` matches the buffer length.
    pub fn is_sane(&self) -> bool {
        self.width > 0
            && self.height > 0
            && !self.data.is_empty()
            && self.width.checked_mul(self.height) == Some(self.data.len())
    }

    pub fn pixel(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    pub fn row(&self, y: usize) -> &[u8] {
        &self.data[y * self.width..(y + 1) * self.width]
    }

    /// Bilinear upscale by integer factors. Flags carry over.
    pub fn resize(&self, w_factor: usize, h_factor: usize) -> Image {
        let width = self.width * w_factor;
        let height = self.height * h_factor;
        let mut data = Vec::with_capacity(width * height);
        // Source coordinate of a destination pixel centre, clamped to the edges
        let source = |dst: usize, factor: usize, len: usize| {
            let pos = ((dst as f32 + 0.5) / factor as f32 - 0.5).max(0.0);
            let lo = (pos as usize).min(len - 1);
            let hi = (lo + 1).min(len - 1);
            (lo, hi, pos - lo as f32)
        };
        for y in 0..height {
            let (y0, y1, fy) = source(y, h_factor, self.height);
            for x in 0..width {
                let (x0, x1, fx) = source(x, w_factor, self.width);
                let lerp = |a: u8, b: u8, t: f32| a as f32 + (b as f32 - a as f32) * t;
                let top = lerp(self.pixel(x0, y0), self.pixel(x1, y0), fx);
                let bottom = lerp(self.pixel(x0, y1), self.pixel(x1, y1), fx);
                data.push((top + (bottom - top) * fy).round() as u8);
            }
        }
        Image {
            width,
            height,
            data,
            flags: self.flags,
        }
    }

    /// Undo orientation and inversion flags so the image reads upright
    /// with dark ridges.
    pub fn standardize(&mut self) {
        if self.flags.contains(ImageFlags::V_FLIPPED) {
            self.vflip();
            self.flags.remove(ImageFlags::V_FLIPPED);
        }
        if self.flags.contains(ImageFlags::H_FLIPPED) {
            self.hflip();
            self.flags.remove(ImageFlags::H_FLIPPED);
        }
        if self.flags.contains(ImageFlags::COLORS_INVERTED) {
            self.invert_colors();
            self.flags.remove(ImageFlags::COLORS_INVERTED);
        }
    }

    fn vflip(&mut self) {
        let width = self.width;
        let height = self.height;
        for i in 0..height / 2 {
            let (top, bottom) = self.data.split_at_mut((height - i - 1) * width);
            top[i * width..(i + 1) * width].swap_with_slice(&mut bottom[..width]);
        }
    }

    fn hflip(&mut self) {
        for row in self.data.chunks_exact_mut(self.width) {
            row.reverse();
        }
    }

    fn invert_colors(&mut self) {
        for px in &mut self.data {
            *px = 0xff - *px;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanity() {
        assert!(Image::new(4, 3).is_sane());
        assert!(!Image::new(0, 3).is_sane());
        assert!(!Image::from_data(4, 3, vec![0; 11]).is_sane());
    }

    #[test]
    fn test_standardize_flips_and_inverts() {
        let mut img = Image::from_data(3, 2, vec![1, 2, 3, 4, 5, 6])
            .with_flags(ImageFlags::V_FLIPPED | ImageFlags::H_FLIPPED);
        img.standardize();
        assert_eq!(img.data, vec![6, 5, 4, 3, 2, 1]);
        assert!(img.flags.is_empty());

        let mut img = Image::from_data(2, 1, vec![0x00, 0x10])
            .with_flags(ImageFlags::COLORS_INVERTED | ImageFlags::PARTIAL);
        img.standardize();
        assert_eq!(img.data, vec![0xff, 0xef]);
        assert_eq!(img.flags, ImageFlags::PARTIAL);
    }

    #[test]
    fn test_resize_doubles_and_blends() {
        let img = Image::from_data(2, 1, vec![0, 100]).with_flags(ImageFlags::H_FLIPPED);
        let big = img.resize(2, 2);
        assert_eq!((big.width, big.height), (4, 2));
        assert!(big.is_sane());
        assert_eq!(big.row(0), &[0, 25, 75, 100]);
        assert_eq!(big.row(0), big.row(1));
        assert_eq!(big.flags, ImageFlags::H_FLIPPED);
    }

    #[test]
    fn test_vflip_odd_height_keeps_middle_row() {
        let mut img = Image::from_data(2, 3, vec![1, 1, 2, 2, 3, 3]).with_flags(ImageFlags::V_FLIPPED);
        img.standardize();
        assert_eq!(img.data, vec![3, 3, 2, 2, 1, 1]);
    }
}
