//! Receptive-field coordinate mapping shared by every kernel.
//!
//! A target unit at `(x, y)` looks at a `(2R+1)^2` window of the source
//! field centred on `round(x * ratio)`, where `ratio = (source + 1) /
//! (target + 1)` per axis. Taps falling outside the source are skipped.

use crate::tensor::Extent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceptiveField {
    pub source: Extent,
    pub target: Extent,
    pub radius: u32,
}

impl ReceptiveField {
    pub const fn new(source: Extent, target: Extent, radius: u32) -> Self {
        Self {
            source,
            target,
            radius,
        }
    }

    #[inline]
    pub fn diameter(&self) -> u32 {
        self.radius * 2 + 1
    }

    /// Window entries per target unit, the depth of the weight tensor.
    #[inline]
    pub fn taps(&self) -> u32 {
        self.diameter() * self.diameter()
    }

    #[inline]
    pub fn ratio(&self) -> (f32, f32) {
        (
            (self.source.width as f32 + 1.0) / (self.target.width as f32 + 1.0),
            (self.source.height as f32 + 1.0) / (self.target.height as f32 + 1.0),
        )
    }

    /// Source coordinate the window of target unit `(x, y)` is centred on.
    #[inline]
    pub fn center(&self, x: u32, y: u32) -> (i32, i32) {
        let (rx, ry) = self.ratio();
        ((x as f32 * rx).round() as i32, (y as f32 * ry).round() as i32)
    }

    /// Visits every in-bounds tap as `(k, source_index)`, `k` being the tap
    /// slot in the weight tensor and `source_index` the flat offset into the
    /// source field.
    #[inline]
    pub fn for_each_tap(&self, x: u32, y: u32, mut f: impl FnMut(usize, usize)) {
        let (cx, cy) = self.center(x, y);
        let r = self.radius as i32;
        let d = self.diameter() as usize;
        let (w, h) = (self.source.width as i32, self.source.height as i32);
        for dy in -r..=r {
            let sy = cy + dy;
            if sy < 0 || sy >= h {
                continue;
            }
            for dx in -r..=r {
                let sx = cx + dx;
                if sx < 0 || sx >= w {
                    continue;
                }
                let k = (dx + r) as usize + (dy + r) as usize * d;
                f(k, sx as usize + sy as usize * w as usize);
            }
        }
    }

    /// Tap slot of the window centre.
    #[inline]
    pub fn center_tap(&self) -> usize {
        let r = self.radius as usize;
        r + r * self.diameter() as usize
    }
}
