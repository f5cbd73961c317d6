use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

fn gradient(width: u32, height: u32, seed: u8) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, seed])
    }))
}

/// JPEG of the given size; different seeds give different bytes.
pub fn jpeg_bytes(width: u32, height: u32, seed: u8) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    gradient(width, height, seed)
        .write_to(&mut buf, ImageFormat::Jpeg)
        .expect("Failed to encode JPEG fixture");
    buf.into_inner()
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    gradient(width, height, 0)
        .write_to(&mut buf, ImageFormat::Png)
        .expect("Failed to encode PNG fixture");
    buf.into_inner()
}
