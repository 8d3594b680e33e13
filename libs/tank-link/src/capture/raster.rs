//! The offscreen drawing surface shared by every capture.

use std::sync::{Mutex, OnceLock};

use image::{
    DynamicImage, Rgba, RgbImage, RgbaImage,
    codecs::jpeg::JpegEncoder,
    imageops::{self, FilterType},
};

use crate::error::Error;

static SURFACE: OnceLock<RasterSurface> = OnceLock::new();

pub struct RasterSurface {
    canvas: Mutex<RgbaImage>,
}

impl RasterSurface {
    /// The process-wide surface, allocated on first use.
    pub fn shared() -> &'static RasterSurface {
        SURFACE.get_or_init(|| RasterSurface {
            canvas: Mutex::new(RgbaImage::new(0, 0)),
        })
    }

    /// Clears the surface, draws `frame` scaled to `size`×`size` and returns
    /// the composited pixels.
    pub fn draw(&self, frame: &DynamicImage, size: u32) -> Result<RgbImage, Error> {
        if frame.width() == 0 || frame.height() == 0 || size == 0 {
            return Err(Error::InvalidImage);
        }
        let mut canvas = self.canvas.lock().map_err(|_| Error::SurfaceUnavailable)?;
        if canvas.dimensions() != (size, size) {
            *canvas = RgbaImage::new(size, size);
        }
        canvas.pixels_mut().for_each(|p| *p = Rgba([0, 0, 0, 0]));
        let scaled = imageops::resize(&frame.to_rgba8(), size, size, FilterType::Triangle);
        imageops::overlay(&mut *canvas, &scaled, 0, 0);
        Ok(DynamicImage::ImageRgba8(canvas.clone()).to_rgb8())
    }
}

pub fn encode_jpeg(raster: &RgbImage, quality: u8) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    encoder.encode_image(raster)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::is_jpeg;

    fn solid(w: u32, h: u32, px: [u8; 4]) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba(px)))
    }

    #[test]
    fn surface_is_cleared_between_draws() {
        let surface = RasterSurface {
            canvas: Mutex::new(RgbaImage::new(0, 0)),
        };
        let red = surface.draw(&solid(32, 16, [255, 0, 0, 255]), 8).unwrap();
        assert_eq!(red.dimensions(), (8, 8));
        assert_eq!(red.get_pixel(4, 4).0, [255, 0, 0]);

        // a fully transparent frame must not let the red show through
        let clear = surface.draw(&solid(8, 8, [0, 0, 0, 0]), 8).unwrap();
        assert_eq!(clear.get_pixel(4, 4).0, [0, 0, 0]);
    }

    #[test]
    fn empty_frame_is_rejected() {
        let surface = RasterSurface::shared();
        assert!(matches!(
            surface.draw(&solid(0, 0, [0; 4]), 8),
            Err(Error::InvalidImage)
        ));
    }

    #[test]
    fn encoded_output_is_jpeg() {
        let raster = RgbImage::from_pixel(4, 4, image::Rgb([10, 20, 30]));
        let jpeg = encode_jpeg(&raster, 85).unwrap();
        assert!(is_jpeg(&jpeg));
    }
}
