//! Frame buffers.
//!
//! - `Frame`: owned RGB24 pixel buffer in source space.
//! - Cropping and resizing for detector input.
//! - Overlay drawing for the annotated frame handed back to callers.
//!
//! A frame lives for one pipeline iteration. Anything downstream that needs
//! pixels beyond that must copy them.

use anyhow::{anyhow, Result};

use crate::roi::Region;

/// Bytes per pixel for RGB24.
pub const CHANNELS: usize = 3;

/// RGB color used by overlays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub const GREEN: Rgb = Rgb(0, 255, 0);

    /// Stable per-class color so the same class keeps its box color across frames.
    pub fn for_class(class_name: &str) -> Rgb {
        let mut h: u32 = 2166136261;
        for b in class_name.to_lowercase().bytes() {
            h ^= b as u32;
            h = h.wrapping_mul(16777619);
        }
        // Keep channels bright enough to read over video.
        Rgb(
            96 + (h & 0x9f) as u8,
            96 + ((h >> 8) & 0x9f) as u8,
            96 + ((h >> 16) & 0x9f) as u8,
        )
    }
}

/// Owned RGB24 frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Wrap RGB24 bytes. Fails when the length does not match the dimensions.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(CHANNELS))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Solid-color frame.
    pub fn filled(width: u32, height: u32, color: Rgb) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize * CHANNELS);
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&[color.0, color.1, color.2]);
        }
        Self {
            data,
            width,
            height,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgb> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * CHANNELS;
        Some(Rgb(self.data[idx], self.data[idx + 1], self.data[idx + 2]))
    }

    fn put(&mut self, x: u32, y: u32, color: Rgb) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = (y as usize * self.width as usize + x as usize) * CHANNELS;
        self.data[idx] = color.0;
        self.data[idx + 1] = color.1;
        self.data[idx + 2] = color.2;
    }

    /// Copy out a region. The region is clamped to the frame first.
    pub fn crop(&self, region: Region) -> Result<Frame> {
        let region = region
            .clamp_to(self.width, self.height)
            .ok_or_else(|| anyhow!("region {:?} lies outside the frame", region))?;
        let row_bytes = region.width as usize * CHANNELS;
        let mut data = Vec::with_capacity(row_bytes * region.height as usize);
        for row in region.y..region.bottom() {
            let start = (row as usize * self.width as usize + region.x as usize) * CHANNELS;
            data.extend_from_slice(&self.data[start..start + row_bytes]);
        }
        Ok(Frame {
            data,
            width: region.width,
            height: region.height,
        })
    }

    /// Nearest-neighbour resize. Returns `self` unchanged when already at size.
    pub fn resized(self, width: u32, height: u32) -> Result<Frame> {
        if width == 0 || height == 0 {
            return Err(anyhow!("resize target must be non-empty"));
        }
        if self.width == width && self.height == height {
            return Ok(self);
        }
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!("cannot resize an empty frame"));
        }
        let mut data = Vec::with_capacity(width as usize * height as usize * CHANNELS);
        for y in 0..height {
            let sy = (y as u64 * self.height as u64 / height as u64) as usize;
            for x in 0..width {
                let sx = (x as u64 * self.width as u64 / width as u64) as usize;
                let idx = (sy * self.width as usize + sx) * CHANNELS;
                data.extend_from_slice(&self.data[idx..idx + CHANNELS]);
            }
        }
        Ok(Frame {
            data,
            width,
            height,
        })
    }

    /// Outline a rectangle given in source pixels. Edges outside the frame are skipped.
    pub fn draw_rect(&mut self, x: i64, y: i64, width: i64, height: i64, thickness: u32, color: Rgb) {
        if width <= 0 || height <= 0 {
            return;
        }
        let x2 = x + width - 1;
        let y2 = y + height - 1;
        for t in 0..thickness as i64 {
            self.hline(x, x2, y + t, color);
            self.hline(x, x2, y2 - t, color);
            self.vline(x + t, y, y2, color);
            self.vline(x2 - t, y, y2, color);
        }
    }

    /// Outline a box given by its center and size.
    pub fn draw_centered_box(&mut self, cx: f32, cy: f32, w: f32, h: f32, color: Rgb) {
        let x = (cx - w / 2.0).round() as i64;
        let y = (cy - h / 2.0).round() as i64;
        self.draw_rect(x, y, w.round() as i64, h.round() as i64, 2, color);
    }

    pub fn draw_region(&mut self, region: Region, color: Rgb) {
        self.draw_rect(
            region.x as i64,
            region.y as i64,
            region.width as i64,
            region.height as i64,
            2,
            color,
        );
    }

    fn hline(&mut self, x1: i64, x2: i64, y: i64, color: Rgb) {
        if y < 0 || y >= self.height as i64 {
            return;
        }
        let start = x1.max(0);
        let end = x2.min(self.width as i64 - 1);
        for x in start..=end {
            self.put(x as u32, y as u32, color);
        }
    }

    fn vline(&mut self, x: i64, y1: i64, y2: i64, color: Rgb) {
        if x < 0 || x >= self.width as i64 {
            return;
        }
        let start = y1.max(0);
        let end = y2.min(self.height as i64 - 1);
        for y in start..=end {
            self.put(x as u32, y as u32, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Frame {
        let mut data = Vec::new();
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[x as u8, y as u8, 0]);
            }
        }
        Frame::from_rgb(data, width, height).unwrap()
    }

    #[test]
    fn rgb_length_is_validated() {
        assert!(Frame::from_rgb(vec![0u8; 11], 2, 2).is_err());
        assert!(Frame::from_rgb(vec![0u8; 12], 2, 2).is_ok());
    }

    #[test]
    fn crop_copies_the_region() -> Result<()> {
        let frame = gradient(16, 8);
        let crop = frame.crop(Region::new(4, 2, 3, 2).unwrap())?;
        assert_eq!(crop.size(), (3, 2));
        assert_eq!(crop.pixel(0, 0), Some(Rgb(4, 2, 0)));
        assert_eq!(crop.pixel(2, 1), Some(Rgb(6, 3, 0)));
        Ok(())
    }

    #[test]
    fn crop_clamps_overhanging_region() -> Result<()> {
        let frame = gradient(16, 8);
        let crop = frame.crop(Region::new(12, 6, 50, 50).unwrap())?;
        assert_eq!(crop.size(), (4, 2));
        Ok(())
    }

    #[test]
    fn crop_outside_the_frame_is_an_error() {
        let frame = gradient(16, 8);
        assert!(frame.crop(Region::new(20, 0, 4, 4).unwrap()).is_err());
    }

    #[test]
    fn resize_samples_nearest() -> Result<()> {
        let frame = gradient(4, 4).resized(2, 2)?;
        assert_eq!(frame.size(), (2, 2));
        assert_eq!(frame.pixel(1, 1), Some(Rgb(2, 2, 0)));
        Ok(())
    }

    #[test]
    fn draw_rect_skips_offscreen_edges() {
        let mut frame = Frame::filled(10, 10, Rgb(0, 0, 0));
        frame.draw_rect(-5, 2, 10, 4, 1, Rgb::GREEN);
        assert_eq!(frame.pixel(0, 2), Some(Rgb::GREEN));
        assert_eq!(frame.pixel(4, 3), Some(Rgb::GREEN));
        assert_eq!(frame.pixel(3, 3), Some(Rgb(0, 0, 0)));
    }

    #[test]
    fn class_colors_are_stable() {
        assert_eq!(Rgb::for_class("Truck"), Rgb::for_class("truck"));
    }
}
