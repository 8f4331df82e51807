//! Line assembly for sensors with two interleaved scan rows.
//!
//! Lines alternate between the two sensor rows. For each even line the
//! advance to the best-matching later line tells how fast the finger moved;
//! the advances are median filtered and the output is resampled to a fixed
//! vertical resolution.

use tracing::debug;

use crate::error::{FpError, ScanRetry};
use crate::image::{Image, ImageFlags};

pub type LineDeviation = fn(&LineAsmblCtx, &[u8], &[u8]) -> i32;
pub type LinePixel = fn(&LineAsmblCtx, &[u8], usize) -> u8;

#[derive(Debug, Clone)]
pub struct LineAsmblCtx {
    pub line_width: usize,
    pub max_height: usize,
    /// Output lines per unit of sensor-row distance.
    pub resolution: usize,
    pub median_filter_size: usize,
    pub max_search_offset: usize,
    pub get_deviation: LineDeviation,
    pub get_pixel: LinePixel,
}

/// Running median; windows shrink at both ends.
pub fn median_filter(data: &mut [i32], filter_size: usize) {
    let half = filter_size.saturating_sub(1) / 2;
    let size = data.len();
    let mut result = Vec::with_capacity(size);
    let mut window = Vec::with_capacity(filter_size.max(1));

    for i in 0..size {
        let lo = i.saturating_sub(half);
        let hi = (i + half).min(size - 1);
        window.clear();
        window.extend_from_slice(&data[lo..=hi]);
        window.sort_unstable();
        result.push(window[window.len() / 2]);
    }
    data.copy_from_slice(&result);
}

fn interpolate_lines(
    ctx: &LineAsmblCtx,
    line1: &[u8],
    y1: f32,
    line2: &[u8],
    y2: f32,
    output: &mut [u8],
    yi: f32,
) {
    for (i, out) in output.iter_mut().enumerate().take(ctx.line_width) {
        let p1 = (ctx.get_pixel)(ctx, line1, i) as f32;
        let p2 = (ctx.get_pixel)(ctx, line2, i) as f32;
        *out = (p1 + (yi - y1) / (y2 - y1) * (p2 - p1)) as u8;
    }
}

/// Best later line matching each even line, as an advance in lines.
fn find_offsets<L: AsRef<[u8]>>(ctx: &LineAsmblCtx, lines: &[L]) -> Vec<i32> {
    let n = lines.len();
    let mut offsets = vec![0i32; n / 2];

    let mut i = 0;
    while i + 1 < n {
        let first = i + 1;
        let last = (i + ctx.max_search_offset).min(n - 1);
        let mut best_match = i;
        let mut best_diff = 0;
        for j in first..=last {
            let diff = (ctx.get_deviation)(ctx, lines[i].as_ref(), lines[j].as_ref());
            if j == first || diff < best_diff {
                best_diff = diff;
                best_match = j;
            }
        }
        offsets[i / 2] = (best_match - i) as i32;
        i += 2;
    }
    offsets
}

/// Rescale a line sequence into an image, compensating swipe speed.
pub fn assemble_lines<L: AsRef<[u8]>>(ctx: &LineAsmblCtx, lines: &[L]) -> Result<Image, FpError> {
    if lines.len() < 2 {
        return Err(FpError::Capture(ScanRetry::TooShort));
    }

    let mut offsets = find_offsets(ctx, lines);
    let filtered = offsets.len().saturating_sub(1);
    median_filter(&mut offsets[..filtered], ctx.median_filter_size);
    debug!(lines = lines.len(), offsets = offsets.len(), "Line offsets computed");

    let width = ctx.line_width;
    let mut output = vec![0u8; width * ctx.max_height];
    let mut y = 0.0f32;
    let mut line_ind = 0usize;

    'outer: for i in 0..lines.len() - 1 {
        let offset = offsets[i / 2];
        if offset <= 0 {
            continue;
        }
        let ynext = y + ctx.resolution as f32 / offset as f32;
        while (line_ind as f32) < ynext {
            if line_ind >= ctx.max_height {
                break 'outer;
            }
            interpolate_lines(
                ctx,
                lines[i].as_ref(),
                y,
                lines[i + 1].as_ref(),
                ynext,
                &mut output[line_ind * width..(line_ind + 1) * width],
                line_ind as f32,
            );
            line_ind += 1;
        }
        y = ynext;
    }

    if line_ind == 0 {
        return Err(FpError::Capture(ScanRetry::TooShort));
    }
    output.truncate(width * line_ind);
    Ok(Image::from_data(width, line_ind, output).with_flags(ImageFlags::V_FLIPPED))
}
