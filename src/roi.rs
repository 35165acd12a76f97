//! Region-of-interest mapping.
//!
//! Three coordinate spaces meet here:
//! - widget space: the viewport a caller draws into (pointer drags land here)
//! - display space: the frame scaled to fit the viewport, aspect preserved, centered
//! - source space: the frame's own pixel grid (after pipeline input normalization)
//!
//! `DisplayTransform` captures scale + offset for one rendered frame. The
//! conversions are pure so they can be driven from any UI shell.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Rectangle in source-space pixels. Always non-empty once constructed
/// through `Region::new` or the mapping helpers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    /// Returns `None` for zero-sized regions.
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self {
            x,
            y,
            width,
            height,
        })
    }

    /// Intersect with a `frame_width` x `frame_height` frame.
    ///
    /// `None` when the region lies entirely outside the frame.
    pub fn clamp_to(&self, frame_width: u32, frame_height: u32) -> Option<Region> {
        if self.x >= frame_width || self.y >= frame_height {
            return None;
        }
        let width = self.width.min(frame_width - self.x);
        let height = self.height.min(frame_height - self.y);
        Region::new(self.x, self.y, width, height)
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }
}

/// Axis-aligned rectangle in widget space, as produced by a pointer drag.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WidgetRect {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl WidgetRect {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Drag corners may arrive in any order.
    pub fn normalized(&self) -> Self {
        Self {
            x1: self.x1.min(self.x2),
            y1: self.y1.min(self.y2),
            x2: self.x1.max(self.x2),
            y2: self.y1.max(self.y2),
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

/// Scale and centering offset for one rendered frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DisplayTransform {
    pub scale: f32,
    pub offset_x: f32,
    pub offset_y: f32,
}

impl DisplayTransform {
    /// Aspect-fit a `frame` into a `viewport`, centered.
    ///
    /// Returns `None` when either surface has a zero dimension.
    pub fn fit(viewport: (u32, u32), frame: (u32, u32)) -> Option<Self> {
        let (vw, vh) = viewport;
        let (fw, fh) = frame;
        if vw == 0 || vh == 0 || fw == 0 || fh == 0 {
            return None;
        }
        let scale = (vw as f32 / fw as f32).min(vh as f32 / fh as f32);
        let scaled_w = fw as f32 * scale;
        let scaled_h = fh as f32 * scale;
        Some(Self {
            scale,
            offset_x: ((vw as f32 - scaled_w) / 2.0).floor(),
            offset_y: ((vh as f32 - scaled_h) / 2.0).floor(),
        })
    }

    pub fn offset(&self) -> (f32, f32) {
        (self.offset_x, self.offset_y)
    }
}

/// Map a widget-space drag rectangle to a source-space region.
///
/// Degenerate selections (empty after clamping to the displayed image) clear
/// the ROI rather than erroring.
pub fn to_source_rect(
    widget_rect: WidgetRect,
    display_offset: (f32, f32),
    display_scale: f32,
    source_size: (u32, u32),
) -> Option<Region> {
    if !(display_scale.is_finite() && display_scale > 0.0) {
        return None;
    }
    let (src_w, src_h) = source_size;
    if src_w == 0 || src_h == 0 {
        return None;
    }
    let rect = widget_rect.normalized();
    let scaled_w = src_w as f32 * display_scale;
    let scaled_h = src_h as f32 * display_scale;
    let (ox, oy) = display_offset;

    let x1 = (rect.x1 - ox).clamp(0.0, scaled_w);
    let y1 = (rect.y1 - oy).clamp(0.0, scaled_h);
    let x2 = (rect.x2 - ox).clamp(0.0, scaled_w);
    let y2 = (rect.y2 - oy).clamp(0.0, scaled_h);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    let inv = 1.0 / display_scale;
    let sx = ((x1 * inv).round() as u32).min(src_w - 1);
    let sy = ((y1 * inv).round() as u32).min(src_h - 1);
    let sw = (((x2 - x1) * inv).round() as u32).min(src_w - sx);
    let sh = (((y2 - y1) * inv).round() as u32).min(src_h - sy);
    Region::new(sx, sy, sw, sh)
}

/// Map a source-space region back into widget space (for drawing the outline).
pub fn to_display_rect(region: Region, display_offset: (f32, f32), display_scale: f32) -> WidgetRect {
    let (ox, oy) = display_offset;
    let x1 = region.x as f32 * display_scale + ox;
    let y1 = region.y as f32 * display_scale + oy;
    WidgetRect {
        x1,
        y1,
        x2: x1 + region.width as f32 * display_scale,
        y2: y1 + region.height as f32 * display_scale,
    }
}

/// ROI cell shared between a UI-facing writer and a pipeline worker.
///
/// The worker copies the value once per iteration; a one-frame-stale read is fine.
#[derive(Clone, Debug, Default)]
pub struct SharedRegion {
    inner: Arc<Mutex<Option<Region>>>,
}

impl SharedRegion {
    pub fn new(initial: Option<Region>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn get(&self) -> Option<Region> {
        match self.inner.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set(&self, region: Option<Region>) {
        match self.inner.lock() {
            Ok(mut guard) => *guard = region,
            Err(poisoned) => *poisoned.into_inner() = region,
        }
    }

    pub fn clear(&self) {
        self.set(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_centers_letterboxed_frame() {
        let t = DisplayTransform::fit((640, 360), (640, 640)).unwrap();
        assert!((t.scale - 0.5625).abs() < 1e-6);
        assert_eq!(t.offset(), (140.0, 0.0));
    }

    #[test]
    fn drag_maps_to_source_region() {
        // 640x640 frame in a 320x320 viewport: scale 0.5, no offset.
        let t = DisplayTransform::fit((320, 320), (640, 640)).unwrap();
        assert_eq!(t.scale, 0.5);
        assert_eq!(t.offset(), (0.0, 0.0));

        let region = to_source_rect(
            WidgetRect::new(5.0, 5.0, 55.0, 55.0),
            t.offset(),
            t.scale,
            (640, 640),
        );
        assert_eq!(region, Region::new(10, 10, 100, 100));
    }

    #[test]
    fn reversed_drag_is_normalized() {
        let region = to_source_rect(
            WidgetRect::new(55.0, 55.0, 5.0, 5.0),
            (0.0, 0.0),
            0.5,
            (640, 640),
        );
        assert_eq!(region, Region::new(10, 10, 100, 100));
    }

    #[test]
    fn drag_outside_image_clears_roi() {
        // Entirely inside the left letterbox bar.
        let t = DisplayTransform::fit((640, 360), (640, 640)).unwrap();
        let region = to_source_rect(
            WidgetRect::new(10.0, 10.0, 100.0, 100.0),
            t.offset(),
            t.scale,
            (640, 640),
        );
        assert_eq!(region, None);
    }

    #[test]
    fn zero_area_drag_clears_roi() {
        let region = to_source_rect(
            WidgetRect::new(20.0, 20.0, 20.0, 80.0),
            (0.0, 0.0),
            0.5,
            (640, 640),
        );
        assert_eq!(region, None);
    }

    #[test]
    fn drag_is_clamped_to_displayed_image() {
        let region = to_source_rect(
            WidgetRect::new(-30.0, -30.0, 400.0, 400.0),
            (0.0, 0.0),
            0.5,
            (640, 640),
        );
        assert_eq!(region, Region::new(0, 0, 640, 640));
    }

    #[test]
    fn round_trip_stays_within_one_pixel() {
        let cases = [
            ((640, 640), (320, 320)),
            ((1920, 1080), (640, 360)),
            ((640, 480), (1000, 700)),
            ((640, 640), (777, 333)),
        ];
        let regions = [
            Region::new(10, 10, 100, 100).unwrap(),
            Region::new(0, 0, 33, 17).unwrap(),
            Region::new(123, 45, 201, 99).unwrap(),
            Region::new(300, 200, 7, 9).unwrap(),
        ];

        for (frame, viewport) in cases {
            let t = DisplayTransform::fit(viewport, frame).unwrap();
            for region in regions {
                let Some(region) = region.clamp_to(frame.0, frame.1) else {
                    continue;
                };
                let shown = to_display_rect(region, t.offset(), t.scale);
                let back = to_source_rect(shown, t.offset(), t.scale, frame)
                    .expect("round trip keeps region");
                for (a, b) in [
                    (region.x, back.x),
                    (region.y, back.y),
                    (region.width, back.width),
                    (region.height, back.height),
                ] {
                    assert!(
                        a.abs_diff(b) <= 1,
                        "{:?} -> {:?} -> {:?} (frame {:?}, viewport {:?})",
                        region,
                        shown,
                        back,
                        frame,
                        viewport
                    );
                }
            }
        }
    }

    #[test]
    fn clamp_trims_overhang_and_drops_outside_regions() {
        let overhang = Region::new(600, 10, 100, 50).unwrap();
        assert_eq!(overhang.clamp_to(640, 640), Region::new(600, 10, 40, 50));
        assert_eq!(Region::new(700, 10, 50, 50).unwrap().clamp_to(640, 640), None);
        assert_eq!(Region::new(10, 640, 50, 50).unwrap().clamp_to(640, 640), None);
        assert_eq!(Region::new(0, 0, 5, 5).unwrap().clamp_to(0, 0), None);
    }

    #[test]
    fn shared_region_round_trips() {
        let shared = SharedRegion::default();
        assert_eq!(shared.get(), None);
        let worker_view = shared.clone();
        shared.set(Region::new(1, 2, 3, 4));
        assert_eq!(worker_view.get(), Region::new(1, 2, 3, 4));
        worker_view.clear();
        assert_eq!(shared.get(), None);
    }
}
