//! Frame decoding, drawing and JPEG encoding for report and debug images

use super::tracks::BoxCoords;
use crate::error::Result;
use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use std::io::Cursor;

pub const RED: Rgb<u8> = Rgb([255, 0, 0]);
pub const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
pub const ORANGE: Rgb<u8> = Rgb([255, 165, 0]);

/// Decode an encoded frame into RGB
pub fn decode_frame(bytes: &[u8]) -> Result<RgbImage> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Encode RGB to JPEG bytes
pub fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
    img.write_with_encoder(encoder)?;
    Ok(buf.into_inner())
}

fn put(img: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, color);
    }
}

/// Rectangle outline, `thickness` px grown inwards; clipped to the image
pub fn draw_rect(img: &mut RgbImage, bbox: &BoxCoords, color: Rgb<u8>, thickness: u32) {
    let (x1, y1, x2, y2) = (
        bbox.x1 as i64,
        bbox.y1 as i64,
        bbox.x2 as i64,
        bbox.y2 as i64,
    );
    for t in 0..thickness as i64 {
        for x in x1..=x2 {
            put(img, x, y1 + t, color);
            put(img, x, y2 - t, color);
        }
        for y in y1..=y2 {
            put(img, x1 + t, y, color);
            put(img, x2 - t, y, color);
        }
    }
}

/// Full-height vertical line
pub fn draw_vline(img: &mut RgbImage, x: i64, color: Rgb<u8>, thickness: u32) {
    let height = img.height() as i64;
    for dx in 0..thickness as i64 {
        for y in 0..height {
            put(img, x + dx, y, color);
        }
    }
}

/// Filled disc
pub fn fill_dot(img: &mut RgbImage, cx: i64, cy: i64, radius: i64, color: Rgb<u8>) {
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy <= radius * radius {
                put(img, cx + dx, cy + dy, color);
            }
        }
    }
}

/// Report photo: best box in red, resized, JPEG
pub fn render_report(
    frame: &RgbImage,
    bbox: &BoxCoords,
    width: u32,
    height: u32,
    quality: u8,
) -> Result<Vec<u8>> {
    let mut img = frame.clone();
    draw_rect(&mut img, bbox, RED, 4);
    let resized = image::imageops::resize(&img, width, height, FilterType::Triangle);
    encode_jpeg(&resized, quality)
}

/// One box drawn on the debug frame
#[derive(Debug, Clone)]
pub struct DebugBox {
    pub bbox: BoxCoords,
    pub centered: bool,
}

/// Debug frame: centre band, boxes (green centred, red otherwise) with centre dots
pub fn render_debug(
    frame: &RgbImage,
    band: (f64, f64),
    boxes: &[DebugBox],
    quality: u8,
) -> Result<Vec<u8>> {
    let mut img = frame.clone();
    let width = img.width() as f64;
    draw_vline(&mut img, (band.0 * width) as i64, ORANGE, 2);
    draw_vline(&mut img, (band.1 * width) as i64, ORANGE, 2);

    for b in boxes {
        let color = if b.centered { GREEN } else { RED };
        draw_rect(&mut img, &b.bbox, color, 2);
        let (cx, cy) = b.bbox.center();
        fill_dot(&mut img, cx as i64, cy as i64, 5, RED);
    }

    encode_jpeg(&img, quality)
}
