//! Swipe-strip assembly.
//!
//! Strips arrive in sensor order; each carries the displacement relative to
//! its predecessor. Displacements are either supplied by the sensor or
//! recovered by [`do_movement_estimation`], then [`assemble_frames`] blits
//! every strip onto a canvas at its cumulative offset.

use tracing::debug;

use crate::error::{FpError, ScanRetry};
use crate::image::{Image, ImageFlags};

/// One strip and its displacement from the previous strip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub delta_x: i32,
    pub delta_y: i32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            delta_x: 0,
            delta_y: 0,
            data,
        }
    }

    pub fn with_delta(data: Vec<u8>, delta_x: i32, delta_y: i32) -> Self {
        Self {
            delta_x,
            delta_y,
            data,
        }
    }
}

/// Storage layout of strip pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// One byte per pixel, row-major.
    Gray8,
    /// Two 4-bit pixels per byte, column-major, low nibble first.
    AesPacked4,
}

/// Geometry and search parameters of one strip sensor.
#[derive(Debug, Clone)]
pub struct FrameAsmblCtx {
    pub frame_width: usize,
    pub frame_height: usize,
    /// Canvas width; the slack on both sides absorbs sideways motion.
    pub image_width: usize,
    pub format: PixelFormat,
    /// Horizontal search window is `-max_dx..=max_dx`.
    pub max_dx: i32,
    /// Smallest vertical advance considered by the search.
    pub min_dy: usize,
    /// Canvas height cap; taller captures are truncated.
    pub max_height: Option<usize>,
}

impl FrameAsmblCtx {
    pub fn new(
        frame_width: usize,
        frame_height: usize,
        image_width: usize,
        format: PixelFormat,
    ) -> Self {
        Self {
            frame_width,
            frame_height,
            image_width,
            format,
            max_dx: 10,
            min_dy: 1,
            max_height: None,
        }
    }

    pub fn with_max_height(mut self, max_height: usize) -> Self {
        self.max_height = Some(max_height);
        self
    }

    /// Bytes a strip of this geometry occupies.
    pub fn frame_len(&self) -> usize {
        match self.format {
            PixelFormat::Gray8 => self.frame_width * self.frame_height,
            PixelFormat::AesPacked4 => self.frame_width * self.frame_height / 2,
        }
    }

    /// 8-bit value of pixel (x, y) of `frame`.
    pub fn pixel(&self, frame: &Frame, x: usize, y: usize) -> u8 {
        match self.format {
            PixelFormat::Gray8 => frame.data[x + y * self.frame_width],
            PixelFormat::AesPacked4 => {
                let byte = frame.data[x * (self.frame_height >> 1) + (y >> 1)];
                let nibble = if y % 2 == 1 { byte >> 4 } else { byte & 0x0f };
                nibble * 17
            }
        }
    }

    fn check_frames(&self, frames: &[Frame]) -> Result<(), FpError> {
        let expected = self.frame_len();
        match frames.iter().position(|f| f.data.len() < expected) {
            Some(i) => Err(FpError::Protocol(format!(
                "strip {} holds {} bytes, geometry needs {}",
                i,
                frames[i].data.len(),
                expected
            ))),
            None => Ok(()),
        }
    }
}

/// Normalized sum of squared differences between `upper` and `lower`
/// when `lower` is placed `dy` rows below and `dx` columns right of `upper`.
fn calc_error(ctx: &FrameAsmblCtx, upper: &Frame, lower: &Frame, dx: i32, dy: usize) -> u64 {
    let shift = dx.unsigned_abs() as usize;
    let width = ctx.frame_width - shift;
    let height = ctx.frame_height - dy;
    let (ux, lx) = if dx >= 0 { (shift, 0) } else { (0, shift) };

    let mut err: u64 = 0;
    for y in 0..height {
        for x in 0..width {
            let a = ctx.pixel(upper, x + ux, y + dy) as i64;
            let b = ctx.pixel(lower, x + lx, y) as i64;
            err += ((a - b) * (a - b)) as u64;
        }
    }

    err * (ctx.frame_width * ctx.frame_height) as u64 / (width * height) as u64
}

/// Best `(dx, dy)` placing `lower` under `upper`, with its error.
/// Ties go to the smaller `|dx|`, then the smaller `dy`, then the
/// negative `dx`.
fn find_overlap(ctx: &FrameAsmblCtx, upper: &Frame, lower: &Frame) -> (i32, i32, u64) {
    let max_dx = ctx.max_dx.min(ctx.frame_width as i32 - 1).max(0);
    let mut best = (0, ctx.min_dy as i32, u64::MAX);

    let rank = |(dx, dy, err): (i32, i32, u64)| (err, dx.unsigned_abs(), dy, dx);
    for dx in -max_dx..=max_dx {
        for dy in ctx.min_dy.max(1)..ctx.frame_height {
            let candidate = (dx, dy as i32, calc_error(ctx, upper, lower, dx, dy));
            if rank(candidate) < rank(best) {
                best = candidate;
            }
        }
    }
    best
}

/// Estimate deltas for every adjacent pair assuming one swipe direction.
fn estimate(ctx: &FrameAsmblCtx, frames: &[Frame], reverse: bool) -> (Vec<(i32, i32)>, u64) {
    let mut deltas = Vec::with_capacity(frames.len().saturating_sub(1));
    let mut total: u64 = 0;

    for pair in frames.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        let (dx, dy, err) = if reverse {
            let (dx, dy, err) = find_overlap(ctx, cur, prev);
            (-dx, -dy, err)
        } else {
            find_overlap(ctx, prev, cur)
        };
        deltas.push((dx, dy));
        total = total.saturating_add(err);
    }

    (deltas, total / frames.len() as u64)
}

/// Recover strip displacements by cross-correlation.
///
/// Both swipe directions are tried; the one with the lower mean error
/// wins. The first strip always gets a zero delta.
pub fn do_movement_estimation(ctx: &FrameAsmblCtx, frames: &mut [Frame]) {
    if frames.len() < 2 || ctx.frame_height < 2 {
        return;
    }

    let (forward, err) = estimate(ctx, frames, false);
    let (reverse, rev_err) = estimate(ctx, frames, true);
    debug!(err, rev_err, "Movement estimation errors");

    let deltas = if err <= rev_err { forward } else { reverse };
    frames[0].delta_x = 0;
    frames[0].delta_y = 0;
    for (frame, (dx, dy)) in frames[1..].iter_mut().zip(deltas) {
        frame.delta_x = dx;
        frame.delta_y = dy;
    }
}

fn blit_stripe(ctx: &FrameAsmblCtx, img: &mut Image, frame: &Frame, x: i64, y: i64) {
    for fy in 0..ctx.frame_height {
        let iy = y + fy as i64;
        if iy < 0 || iy >= img.height as i64 {
            continue;
        }
        for fx in 0..ctx.frame_width {
            let ix = x + fx as i64;
            if ix < 0 || ix >= img.width as i64 {
                continue;
            }
            img.data[ix as usize + iy as usize * img.width] = ctx.pixel(frame, fx, fy);
        }
    }
}

/// Compose strips into one image.
///
/// The canvas is `image_width` wide and `frame_height + |sum(delta_y)|`
/// tall (capped by `max_height`). A negative total means the finger moved
/// the other way; such images are already upright, the others carry both
/// flip flags. Later strips overwrite earlier ones where they overlap.
pub fn assemble_frames(ctx: &FrameAsmblCtx, frames: &[Frame]) -> Result<Image, FpError> {
    if frames.is_empty() {
        return Err(FpError::Capture(ScanRetry::TooShort));
    }
    if ctx.image_width < ctx.frame_width {
        return Err(FpError::protocol("canvas narrower than a strip"));
    }
    ctx.check_frames(frames)?;

    let mut sum: i64 = frames.iter().skip(1).map(|f| f.delta_y as i64).sum();
    let reverse = sum < 0;
    if reverse {
        sum = -sum;
    }
    let mut height = sum as usize + ctx.frame_height;
    debug!(height, strips = frames.len(), reverse, "Assembling strips");
    if let Some(cap) = ctx.max_height {
        height = height.min(cap.max(ctx.frame_height));
    }

    let mut flags = ImageFlags::COLORS_INVERTED;
    if !reverse {
        flags |= ImageFlags::H_FLIPPED | ImageFlags::V_FLIPPED;
    }
    let mut img = Image::new(ctx.image_width, height).with_flags(flags);

    let mut y: i64 = if reverse { sum } else { 0 };
    let mut x: i64 = ((ctx.image_width - ctx.frame_width) / 2) as i64;
    for (i, frame) in frames.iter().enumerate() {
        if i > 0 {
            y += frame.delta_y as i64;
            x += frame.delta_x as i64;
        }
        blit_stripe(ctx, &mut img, frame, x, y);
    }

    Ok(img)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A tall synthetic fingerprint from which strips are cut.
    fn ridge_source(width: usize, height: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push((((x * 7 + y * y * 3 + (x * y) % 11) % 64) * 4) as u8);
            }
        }
        data
    }

    fn cut_strip(src: &[u8], width: usize, top: usize, left: usize, w: usize, h: usize) -> Frame {
        let mut data = Vec::with_capacity(w * h);
        for y in 0..h {
            let row = (top + y) * width;
            data.extend_from_slice(&src[row + left..row + left + w]);
        }
        Frame::new(data)
    }

    #[test]
    fn test_single_strip_height() {
        let ctx = FrameAsmblCtx::new(8, 4, 12, PixelFormat::Gray8);
        let img = assemble_frames(&ctx, &[Frame::new(vec![9; 32])]).unwrap();
        assert_eq!(img.height, 4);
        assert_eq!(img.width, 12);
        assert!(img.is_sane());
        assert!(img.flags.contains(ImageFlags::COLORS_INVERTED | ImageFlags::V_FLIPPED));
        // Strip is centred
        assert_eq!(img.pixel(2, 0), 9);
        assert_eq!(img.pixel(1, 0), 0);
        assert_eq!(img.pixel(10, 3), 0);
    }

    #[test]
    fn test_empty_list_rejected() {
        let ctx = FrameAsmblCtx::new(8, 4, 12, PixelFormat::Gray8);
        assert_eq!(
            assemble_frames(&ctx, &[]),
            Err(FpError::Capture(ScanRetry::TooShort))
        );
    }

    #[test]
    fn test_short_strip_rejected() {
        let ctx = FrameAsmblCtx::new(8, 4, 12, PixelFormat::Gray8);
        let frames = vec![Frame::new(vec![0; 32]), Frame::new(vec![0; 31])];
        assert!(matches!(
            assemble_frames(&ctx, &frames),
            Err(FpError::Protocol(_))
        ));
    }

    #[test]
    fn test_movement_estimation_recovers_advance() {
        let (w, h) = (24, 8);
        let src = ridge_source(w + 8, 64);
        let mut frames: Vec<Frame> = (0..5)
            .map(|i| cut_strip(&src, w + 8, i * 3, 4, w, h))
            .collect();

        let ctx = FrameAsmblCtx::new(w, h, w + w / 2, PixelFormat::Gray8);
        do_movement_estimation(&ctx, &mut frames);

        assert_eq!((frames[0].delta_x, frames[0].delta_y), (0, 0));
        for frame in &frames[1..] {
            assert_eq!((frame.delta_x, frame.delta_y), (0, 3));
        }

        let img = assemble_frames(&ctx, &frames).unwrap();
        assert_eq!(img.height, h + 4 * 3);
    }

    #[test]
    fn test_movement_estimation_sideways() {
        let (w, h) = (24, 8);
        let src = ridge_source(w + 8, 64);
        let frames_src = [(0, 4), (2, 6)];
        let mut frames: Vec<Frame> = frames_src
            .iter()
            .map(|&(top, left)| cut_strip(&src, w + 8, top, left, w, h))
            .collect();

        let ctx = FrameAsmblCtx::new(w, h, w + w / 2, PixelFormat::Gray8);
        do_movement_estimation(&ctx, &mut frames);
        assert_eq!((frames[1].delta_x, frames[1].delta_y), (2, 2));
    }

    #[test]
    fn test_reverse_swipe_detected() {
        let (w, h) = (24, 8);
        let src = ridge_source(w, 64);
        let mut frames: Vec<Frame> = (0..4)
            .map(|i| cut_strip(&src, w, 30 - i * 2, 0, w, h))
            .collect();

        let ctx = FrameAsmblCtx::new(w, h, w, PixelFormat::Gray8);
        do_movement_estimation(&ctx, &mut frames);
        for frame in &frames[1..] {
            assert_eq!(frame.delta_y, -2);
        }

        let img = assemble_frames(&ctx, &frames).unwrap();
        assert_eq!(img.height, h + 6);
        assert!(!img.flags.contains(ImageFlags::V_FLIPPED));
        // The first strip lands at the bottom of the canvas
        assert_eq!(img.row(img.height - 1), &frames[0].data[(h - 1) * w..]);
    }

    #[test]
    fn test_overlap_ties_prefer_straight_shift() {
        let (w, h) = (8, 6);
        let ctx = FrameAsmblCtx::new(w, h, w, PixelFormat::Gray8);

        let flat = Frame::new(vec![40; w * h]);
        assert_eq!(find_overlap(&ctx, &flat, &flat), (0, 1, 0));

        // Diagonal stripes match at (0, 2) and at (+-1, 1)
        let stripes: Vec<u8> = (0..w * h)
            .map(|i| (((i % w) + (i / w)) % 2 * 100) as u8)
            .collect();
        let stripes = Frame::new(stripes);
        assert_eq!(find_overlap(&ctx, &stripes, &stripes), (0, 2, 0));
    }

    #[test]
    fn test_packed_pixel_access() {
        let ctx = FrameAsmblCtx::new(2, 4, 2, PixelFormat::AesPacked4);
        // Column 0 rows 0..3 = 1,2,3,4 ; column 1 rows 0..3 = 5,6,7,8
        let frame = Frame::new(vec![0x21, 0x43, 0x65, 0x87]);
        assert_eq!(ctx.frame_len(), 4);
        assert_eq!(ctx.pixel(&frame, 0, 0), 17);
        assert_eq!(ctx.pixel(&frame, 0, 1), 34);
        assert_eq!(ctx.pixel(&frame, 0, 3), 68);
        assert_eq!(ctx.pixel(&frame, 1, 2), 7 * 17);
    }

    #[test]
    fn test_height_cap_truncates() {
        let ctx = FrameAsmblCtx::new(4, 2, 4, PixelFormat::Gray8).with_max_height(5);
        let frames: Vec<Frame> = (0..6)
            .map(|i| Frame::with_delta(vec![i as u8; 8], 0, if i == 0 { 0 } else { 2 }))
            .collect();
        let img = assemble_frames(&ctx, &frames).unwrap();
        assert_eq!(img.height, 5);
        assert!(img.is_sane());
    }
}
