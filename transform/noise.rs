use crate::error::{Result, TransformError};
use crate::progress::PassStage;
use crate::raster::Raster;
use crate::tiling::TileScheduler;

/// Produces a noise estimate of a raster (same extent, same bands) for MNF.
pub trait NoiseExtractor: Send + Sync {
    fn extract(&self, scheduler: &TileScheduler, raster: &Raster) -> Result<Raster>;
}

/// High-pass residual: every pixel minus the mean of its neighbours in a
/// `(2r + 1)²` window. Windows are clipped at the raster border.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalActivity {
    pub radius: usize,
}

impl Default for LocalActivity {
    fn default() -> Self {
        Self { radius: 1 }
    }
}

impl NoiseExtractor for LocalActivity {
    fn extract(&self, scheduler: &TileScheduler, raster: &Raster) -> Result<Raster> {
        if self.radius == 0 {
            return Err(TransformError::invalid("local activity radius must be positive"));
        }
        if raster.n_pixels() < 2 {
            return Err(TransformError::invalid(
                "local activity needs at least two pixels",
            ));
        }
        let radius = self.radius;
        let bands = raster.bands();
        let (width, height) = (raster.width(), raster.height());
        let mut output = Raster::zeros(width, height, bands)?;

        scheduler.for_each_region_mut(PassStage::NoiseExtraction, &mut output, |region, rows| {
            let mut sum = vec![0.0; bands];
            for (offset, out_row) in rows.iter_mut().enumerate() {
                let y = region.y + offset;
                let y0 = y.saturating_sub(radius);
                let y1 = (y + radius).min(height - 1);
                for (col, out) in out_row.chunks_exact_mut(bands).enumerate() {
                    let x = region.x + col;
                    let x0 = x.saturating_sub(radius);
                    let x1 = (x + radius).min(width - 1);

                    sum.iter_mut().for_each(|acc| *acc = 0.0);
                    for wy in y0..=y1 {
                        for wx in x0..=x1 {
                            if wx == x && wy == y {
                                continue;
                            }
                            for (acc, &value) in sum.iter_mut().zip(raster.pixel(wx, wy)) {
                                *acc += value;
                            }
                        }
                    }
                    let neighbours = ((y1 - y0 + 1) * (x1 - x0 + 1) - 1) as f64;
                    for ((dst, &value), &acc) in out.iter_mut().zip(raster.pixel(x, y)).zip(&sum) {
                        *dst = value - acc / neighbours;
                    }
                }
            }
        });
        Ok(output)
    }
}
