//! Debug preview: the latest frame with a presence banner, written to disk.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::{DynamicImage, Rgba, RgbaImage};
use tracing::warn;

use crate::frame::Frame;
use crate::presence::Presence;

const PRESENT_COLOR: Rgba<u8> = Rgba([0, 255, 0, 255]);
const ABSENT_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);
const BANNER_COLOR: Rgba<u8> = Rgba([0, 0, 0, 160]);
const TEXT_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);

pub struct PreviewWriter {
    path: PathBuf,
}

impl PreviewWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Never fails the caller; the preview is best-effort.
    pub fn update(&self, frame: &Frame, presence: Presence) {
        if let Err(err) = self.write(frame, presence) {
            warn!(error = %format!("{err:#}"), path = %self.path.display(), "failed to write preview");
        }
    }

    pub fn write(&self, frame: &Frame, presence: Presence) -> Result<()> {
        let rendered = render(frame, presence);
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create preview directory: {}", parent.display())
                })?;
            }
        }
        DynamicImage::ImageRgba8(rendered)
            .save(&self.path)
            .with_context(|| format!("failed to save preview: {}", self.path.display()))?;
        Ok(())
    }
}

pub fn render(frame: &Frame, presence: Presence) -> RgbaImage {
    let mut img = frame.image.to_rgba8();
    let (label, color) = match presence {
        Presence::Present => ("PRESENCE", PRESENT_COLOR),
        Presence::Absent => ("NO PRESENCE", ABSENT_COLOR),
    };
    let scale = (img.width() / 320).clamp(1, 4);
    let (x0, y0, x1, y1) = text_bbox(10, 10, label, scale);
    let pad = 4 * scale as i32;
    let stamp = frame.captured_at.format("%H:%M:%S").to_string();
    let stamp_y = y1 + 2 * scale as i32;
    let (_, _, sx1, sy1) = text_bbox(x0, stamp_y, &stamp, scale);
    fill_rect_alpha(&mut img, x0 - pad, y0 - pad, x1.max(sx1) + pad, sy1 + pad, BANNER_COLOR);
    draw_bitmap_text(&mut img, x0, y0, label, color, scale);
    draw_bitmap_text(&mut img, x0, stamp_y, &stamp, TEXT_COLOR, scale);
    img
}

fn blend_pixel(dst: Rgba<u8>, src: Rgba<u8>) -> Rgba<u8> {
    let a = f64::from(src[3]) / 255.0;
    if a <= 0.0 {
        return dst;
    }
    let inv = 1.0 - a;
    let mix = |d: u8, s: u8| (f64::from(d) * inv + f64::from(s) * a).round().clamp(0.0, 255.0) as u8;
    let out_a = (f64::from(dst[3]) + f64::from(src[3]) * inv)
        .round()
        .clamp(0.0, 255.0) as u8;
    Rgba([mix(dst[0], src[0]), mix(dst[1], src[1]), mix(dst[2], src[2]), out_a])
}

fn put_blended(img: &mut RgbaImage, x: i32, y: i32, color: Rgba<u8>) {
    if x >= 0 && y >= 0 && x < img.width() as i32 && y < img.height() as i32 {
        let dst = *img.get_pixel(x as u32, y as u32);
        img.put_pixel(x as u32, y as u32, blend_pixel(dst, color));
    }
}

fn draw_bitmap_text(img: &mut RgbaImage, x: i32, y: i32, text: &str, color: Rgba<u8>, scale: u32) {
    let scale_i = scale.max(1) as i32;
    let mut cursor_x = x;
    for ch in text.chars() {
        let Some(glyph) = BASIC_FONTS.get(ch).or_else(|| BASIC_FONTS.get('?')) else {
            cursor_x += 8 * scale_i;
            continue;
        };
        for (row_idx, row) in glyph.iter().enumerate() {
            let row_bits = *row;
            for col_idx in 0..8 {
                if (row_bits >> col_idx) & 1 == 0 {
                    continue;
                }
                let px = cursor_x + col_idx * scale_i;
                let py = y + row_idx as i32 * scale_i;
                for sy in 0..scale_i {
                    for sx in 0..scale_i {
                        put_blended(img, px + sx, py + sy, color);
                    }
                }
            }
        }
        cursor_x += 8 * scale_i;
    }
}

fn text_bbox(x: i32, y: i32, text: &str, scale: u32) -> (i32, i32, i32, i32) {
    let scale_i = scale.max(1) as i32;
    let width_chars = text.chars().count() as i32;
    (x, y, x + width_chars * 8 * scale_i, y + 8 * scale_i)
}

fn fill_rect_alpha(img: &mut RgbaImage, x0: i32, y0: i32, x1: i32, y1: i32, color: Rgba<u8>) {
    if img.width() == 0 || img.height() == 0 {
        return;
    }
    let max_x = img.width() as i32 - 1;
    let max_y = img.height() as i32 - 1;
    for y in y0.min(y1).clamp(0, max_y)..=y0.max(y1).clamp(0, max_y) {
        for x in x0.min(x1).clamp(0, max_x)..=x0.max(x1).clamp(0, max_x) {
            put_blended(img, x, y, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    fn white_frame() -> Frame {
        Frame::new(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            320,
            120,
            Rgb([255, 255, 255]),
        )))
    }

    #[test]
    fn banner_color_follows_presence() {
        let present = render(&white_frame(), Presence::Present);
        let absent = render(&white_frame(), Presence::Absent);
        let greenish = present
            .pixels()
            .any(|p| p[1] == 255 && p[0] == 0 && p[2] == 0);
        let reddish = absent
            .pixels()
            .any(|p| p[0] == 255 && p[1] == 0 && p[2] == 0);
        assert!(greenish);
        assert!(reddish);
        // outside the banner the frame is untouched
        assert_eq!(*present.get_pixel(319, 119), Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn writes_preview_and_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("preview.png");
        let writer = PreviewWriter::new(&path);
        writer.write(&white_frame(), Presence::Absent).unwrap();
        let saved = image::open(writer.path()).unwrap();
        assert_eq!((saved.width(), saved.height()), (320, 120));
    }

    #[test]
    fn blend_respects_alpha() {
        let dst = Rgba([200, 200, 200, 255]);
        assert_eq!(blend_pixel(dst, Rgba([0, 0, 0, 0])), dst);
        assert_eq!(blend_pixel(dst, Rgba([10, 20, 30, 255])), Rgba([10, 20, 30, 255]));
    }
}
