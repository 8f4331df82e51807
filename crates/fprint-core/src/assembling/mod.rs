//! Image assembly from strips and lines.

pub mod frames;
pub mod lines;

pub use frames::{Frame, FrameAsmblCtx, PixelFormat, assemble_frames, do_movement_estimation};
pub use lines::{LineAsmblCtx, assemble_lines, median_filter};

/// Stretch 16-bit samples to 8 bits: the minimum maps to 0, the maximum
/// to 255, values in between scale linearly.
pub fn normalize_u16(raw: &[u16]) -> Vec<u8> {
    let Some(&min) = raw.iter().min() else {
        return Vec::new();
    };
    let max = raw.iter().copied().max().unwrap_or(min);

    raw.iter()
        .map(|&px| {
            if px <= min {
                0
            } else if px >= max {
                0xff
            } else {
                ((px - min) as u32 * 0xff / (max - min) as u32) as u8
            }
        })
        .collect()
}

/// Squared standard deviation of a row of pixels.
pub fn std_sq_dev(buf: &[u8]) -> i32 {
    if buf.is_empty() {
        return 0;
    }
    let mean = buf.iter().map(|&p| p as i32).sum::<i32>() / buf.len() as i32;
    buf.iter().map(|&p| (p as i32 - mean).pow(2)).sum::<i32>() / buf.len() as i32
}

/// Mean squared difference between two rows.
pub fn mean_sq_diff_norm(a: &[u8], b: &[u8]) -> i32 {
    if a.is_empty() {
        return 0;
    }
    a.iter()
        .zip(b)
        .map(|(&x, &y)| (x as i32 - y as i32).pow(2))
        .sum::<i32>()
        / a.len() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_statistics() {
        assert_eq!(std_sq_dev(&[10, 10, 10, 10]), 0);
        assert_eq!(std_sq_dev(&[0, 20, 0, 20]), 100);
        assert_eq!(mean_sq_diff_norm(&[0, 0], &[4, 0]), 8);
        assert_eq!(std_sq_dev(&[]), 0);
    }

    #[test]
    fn test_normalize_u16_spreads_range() {
        let out = normalize_u16(&[1000, 1100, 1200, 3000]);
        assert_eq!(out[0], 0);
        assert_eq!(out[3], 0xff);
        assert_eq!(out[1], (100 * 255 / 2000) as u8);
        assert_eq!(out[2], (200 * 255 / 2000) as u8);
    }

    #[test]
    fn test_normalize_flat_frame() {
        assert_eq!(normalize_u16(&[7, 7, 7]), vec![0, 0, 0]);
        assert!(normalize_u16(&[]).is_empty());
    }
}
