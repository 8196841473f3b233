use crate::error::{Result, TransformError};
use crate::progress::PassStage;
use crate::raster::{Raster, Region};
use crate::tiling::TileScheduler;
use ndarray::Array2;

/// Pairwise band dot products over every pixel, bands playing the role of training
/// images.
#[derive(Clone, Debug)]
pub struct InnerProduct {
    pub pixels: u64,
    pub ignored_pixels: u64,
    pub centered: bool,
    pub gram: Array2<f64>,
}

#[derive(Clone, Debug)]
struct GramState {
    pixels: u64,
    ignored: u64,
    gram: Vec<f64>,
    scratch: Vec<f64>,
}

impl GramState {
    fn new(bands: usize) -> Self {
        Self {
            pixels: 0,
            ignored: 0,
            gram: vec![0.0; bands * bands],
            scratch: vec![0.0; bands],
        }
    }

    fn accumulate_region(&mut self, raster: &Raster, region: &Region, center: bool) {
        let bands = raster.bands();
        for pixel in raster.region_pixels(region) {
            let total: f64 = pixel.iter().sum();
            if !total.is_finite() {
                self.ignored += 1;
                continue;
            }
            self.pixels += 1;
            let offset = if center { total / bands as f64 } else { 0.0 };
            for (dst, &value) in self.scratch.iter_mut().zip(pixel) {
                *dst = value - offset;
            }
            for i in 0..bands {
                let xi = self.scratch[i];
                let row = &mut self.gram[i * bands..(i + 1) * bands];
                for j in i..bands {
                    row[j] += xi * self.scratch[j];
                }
            }
        }
    }
}

/// Streaming accumulator for the T×T inner-product matrix of one raster's bands.
#[derive(Debug)]
pub struct InnerProductAccumulator {
    bands: usize,
    center_data: bool,
    partials: Vec<GramState>,
    synthetized: bool,
}

impl InnerProductAccumulator {
    pub fn new(bands: usize, center_data: bool) -> Result<Self> {
        if bands == 0 {
            return Err(TransformError::invalid("inner product needs at least one band"));
        }
        Ok(Self {
            bands,
            center_data,
            partials: Vec::new(),
            synthetized: false,
        })
    }

    pub fn reset(&mut self) {
        self.partials.clear();
        self.synthetized = false;
    }

    pub fn accumulate(&mut self, scheduler: &TileScheduler, raster: &Raster) -> Result<()> {
        if self.synthetized {
            return Err(TransformError::StaleAccumulator);
        }
        if raster.bands() != self.bands {
            return Err(TransformError::mismatch("raster band count", self.bands, raster.bands()));
        }
        let bands = self.bands;
        let center = self.center_data;
        let states = scheduler.accumulate(
            PassStage::InnerProduct,
            raster,
            || GramState::new(bands),
            |state, raster, region| state.accumulate_region(raster, region, center),
        );
        self.partials.extend(states);
        Ok(())
    }

    pub fn synthetize(&mut self) -> Result<InnerProduct> {
        let bands = self.bands;
        let mut total = GramState::new(bands);
        for partial in &self.partials {
            total.pixels += partial.pixels;
            total.ignored += partial.ignored;
            for (acc, value) in total.gram.iter_mut().zip(&partial.gram) {
                *acc += value;
            }
        }
        if total.pixels == 0 {
            return Err(TransformError::EmptyData);
        }

        let mut gram = Array2::<f64>::zeros((bands, bands));
        for i in 0..bands {
            for j in i..bands {
                let value = total.gram[i * bands + j];
                gram[(i, j)] = value;
                gram[(j, i)] = value;
            }
        }
        log::debug!(
            "Synthetized {bands}x{bands} inner product over {} pixels",
            total.pixels
        );
        self.synthetized = true;
        Ok(InnerProduct {
            pixels: total.pixels,
            ignored_pixels: total.ignored,
            centered: self.center_data,
            gram,
        })
    }

    pub fn compute(&mut self, scheduler: &TileScheduler, raster: &Raster) -> Result<InnerProduct> {
        self.reset();
        self.accumulate(scheduler, raster)?;
        self.synthetize()
    }
}
