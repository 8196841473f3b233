use crate::error::{Result, TransformError};
use ndarray::Array2;

/// A rectangular block of pixels; the unit of streaming and parallel work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Region {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Region {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    pub fn rows(&self) -> std::ops::Range<usize> {
        self.y..self.y + self.height
    }
}

/// An owned multi-band raster stored band-interleaved-by-pixel.
///
/// Pixel `(x, y)` occupies `data[(y * width + x) * bands..][..bands]`. Rasters are
/// produced upstream (decoding is not this crate's concern) and are read-only to the
/// engines; every transform allocates a new output raster.
#[derive(Clone, Debug, PartialEq)]
pub struct Raster {
    width: usize,
    height: usize,
    bands: usize,
    data: Vec<f64>,
}

impl Raster {
    /// Allocates a zero-filled raster.
    pub fn zeros(width: usize, height: usize, bands: usize) -> Result<Self> {
        Self::check_shape(width, height, bands)?;
        Ok(Self {
            width,
            height,
            bands,
            data: vec![0.0; width * height * bands],
        })
    }

    pub fn from_vec(width: usize, height: usize, bands: usize, data: Vec<f64>) -> Result<Self> {
        Self::check_shape(width, height, bands)?;
        let expected = width
            .checked_mul(height)
            .and_then(|n| n.checked_mul(bands))
            .ok_or_else(|| TransformError::invalid("raster dimensions overflow"))?;
        if data.len() != expected {
            return Err(TransformError::mismatch(
                "raster buffer length",
                expected,
                data.len(),
            ));
        }
        Ok(Self {
            width,
            height,
            bands,
            data,
        })
    }

    /// Builds a raster from one band vector per pixel, in row-major pixel order.
    pub fn from_pixels(width: usize, height: usize, pixels: &[Vec<f64>]) -> Result<Self> {
        if pixels.len() != width * height {
            return Err(TransformError::mismatch(
                "pixel count",
                width * height,
                pixels.len(),
            ));
        }
        let bands = pixels.first().map(Vec::len).unwrap_or(0);
        let mut data = Vec::with_capacity(pixels.len() * bands);
        for pixel in pixels {
            if pixel.len() != bands {
                return Err(TransformError::mismatch("pixel band count", bands, pixel.len()));
            }
            data.extend_from_slice(pixel);
        }
        Self::from_vec(width, height, bands, data)
    }

    /// Stacks single-band planes (each `width * height` samples) into one raster.
    pub fn from_bands(width: usize, height: usize, planes: &[Vec<f64>]) -> Result<Self> {
        let bands = planes.len();
        Self::check_shape(width, height, bands)?;
        let n_pixels = width * height;
        for plane in planes {
            if plane.len() != n_pixels {
                return Err(TransformError::mismatch("band plane length", n_pixels, plane.len()));
            }
        }
        let mut data = vec![0.0; n_pixels * bands];
        for (b, plane) in planes.iter().enumerate() {
            for (p, &value) in plane.iter().enumerate() {
                data[p * bands + b] = value;
            }
        }
        Self::from_vec(width, height, bands, data)
    }

    fn check_shape(width: usize, height: usize, bands: usize) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(TransformError::invalid("raster extent must be non-empty"));
        }
        if bands == 0 {
            return Err(TransformError::invalid("raster must have at least one band"));
        }
        Ok(())
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn bands(&self) -> usize {
        self.bands
    }

    pub fn n_pixels(&self) -> usize {
        self.width * self.height
    }

    pub fn full_region(&self) -> Region {
        Region::new(0, 0, self.width, self.height)
    }

    pub fn same_extent(&self, other: &Raster) -> bool {
        self.width == other.width && self.height == other.height
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    pub fn pixel(&self, x: usize, y: usize) -> &[f64] {
        let start = (y * self.width + x) * self.bands;
        &self.data[start..start + self.bands]
    }

    pub fn pixel_mut(&mut self, x: usize, y: usize) -> &mut [f64] {
        let start = (y * self.width + x) * self.bands;
        &mut self.data[start..start + self.bands]
    }

    /// The interleaved samples of one row of `region`.
    pub fn region_row(&self, region: &Region, y: usize) -> &[f64] {
        let start = (y * self.width + region.x) * self.bands;
        &self.data[start..start + region.width * self.bands]
    }

    /// Iterates the band vectors of every pixel in `region`, row by row.
    pub fn region_pixels<'a>(&'a self, region: &Region) -> impl Iterator<Item = &'a [f64]> + 'a {
        let region = *region;
        region
            .rows()
            .flat_map(move |y| self.region_row(&region, y).chunks_exact(self.bands))
    }

    /// Copies one band out as a plane of `width * height` samples.
    pub fn band(&self, band: usize) -> Vec<f64> {
        self.data
            .chunks_exact(self.bands)
            .map(|pixel| pixel[band])
            .collect()
    }

    /// Views the raster as a `pixels × bands` matrix (copies).
    pub fn to_pixel_matrix(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.n_pixels(), self.bands), |(p, b)| {
            self.data[p * self.bands + b]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixels_are_interleaved_by_band() {
        let raster = Raster::from_pixels(2, 1, &[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(raster.as_slice(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(raster.pixel(1, 0), &[3.0, 4.0]);
        assert_eq!(raster.band(1), vec![2.0, 4.0]);
    }

    #[test]
    fn from_bands_matches_from_pixels() {
        let planes = vec![vec![1.0, 3.0, 5.0, 7.0], vec![2.0, 4.0, 6.0, 8.0]];
        let stacked = Raster::from_bands(2, 2, &planes).unwrap();
        let pixels = Raster::from_pixels(
            2,
            2,
            &[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0], vec![7.0, 8.0]],
        )
        .unwrap();
        assert_eq!(stacked, pixels);
    }

    #[test]
    fn region_pixels_walks_only_the_region() {
        let data: Vec<f64> = (0..12).map(f64::from).collect();
        let raster = Raster::from_vec(4, 3, 1, data).unwrap();
        let region = Region::new(1, 1, 2, 2);
        let seen: Vec<f64> = raster.region_pixels(&region).map(|p| p[0]).collect();
        assert_eq!(seen, vec![5.0, 6.0, 9.0, 10.0]);
        assert_eq!(raster.full_region().pixel_count(), 12);
    }

    #[test]
    fn buffer_length_mismatch_is_rejected() {
        let err = Raster::from_vec(2, 2, 3, vec![0.0; 11]).unwrap_err();
        assert!(matches!(
            err,
            TransformError::DimensionMismatch {
                expected: 12,
                found: 11,
                ..
            }
        ));
    }

    #[test]
    fn empty_extent_is_invalid() {
        assert!(matches!(
            Raster::zeros(0, 4, 1),
            Err(TransformError::InvalidInput(_))
        ));
        assert!(matches!(
            Raster::zeros(4, 4, 0),
            Err(TransformError::InvalidInput(_))
        ));
    }
}
