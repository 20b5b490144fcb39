//! Binning scattered samples into mean, variance and exposure images.

use itertools::izip;
use ndarray::Array2;
use thiserror::Error;

use crate::error::BadArrayShape;

#[derive(Error, Debug)]
/// Errors that can occur when accumulating an image.
pub enum ImageError {
    #[error(transparent)]
    /// Error for bad array shape in provided argument
    BadArrayShape(#[from] BadArrayShape),

    #[error("{axis} bin edges must be strictly increasing and contain at least two values")]
    /// The pixel grid edges are unusable
    BadEdges {
        /// Which axis ("x" or "y")
        axis: &'static str,
    },
}

/// Bin edges of a 2-D pixel grid.
///
/// Pixel `(i, j)` covers `x_edges[i]..x_edges[i+1]` and
/// `y_edges[j]..y_edges[j+1]`. The last bin along each axis also contains its
/// right edge.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelGrid {
    x_edges: Vec<f64>,
    y_edges: Vec<f64>,
}

impl PixelGrid {
    /// Create a grid from explicit bin edges.
    ///
    /// # Errors
    ///
    /// Will return [`ImageError::BadEdges`] if either edge vector has fewer
    /// than two values or is not strictly increasing.
    pub fn new(x_edges: Vec<f64>, y_edges: Vec<f64>) -> Result<Self, ImageError> {
        fn check(edges: &[f64], axis: &'static str) -> Result<(), ImageError> {
            if edges.len() < 2 || edges.windows(2).any(|w| !(w[1] > w[0])) {
                return Err(ImageError::BadEdges { axis });
            }
            Ok(())
        }
        check(&x_edges, "x")?;
        check(&y_edges, "y")?;
        Ok(Self { x_edges, y_edges })
    }

    /// A regular grid of `nx` × `ny` pixels covering `[x0, x1] × [y0, y1]`.
    ///
    /// # Errors
    ///
    /// See [`PixelGrid::new`].
    pub fn regular(
        (x0, x1): (f64, f64),
        nx: usize,
        (y0, y1): (f64, f64),
        ny: usize,
    ) -> Result<Self, ImageError> {
        let edges = |lo: f64, hi: f64, num: usize| {
            (0..=num)
                .map(|i| lo + (hi - lo) * i as f64 / num.max(1) as f64)
                .collect::<Vec<_>>()
        };
        Self::new(edges(x0, x1, nx), edges(y0, y1, ny))
    }

    /// Number of pixels along (x, y).
    pub fn shape(&self) -> (usize, usize) {
        (self.x_edges.len() - 1, self.y_edges.len() - 1)
    }

    /// Centre of pixel `(i, j)`.
    pub fn pixel_centre(&self, (i, j): (usize, usize)) -> (f64, f64) {
        (
            (self.x_edges[i] + self.x_edges[i + 1]) / 2.0,
            (self.y_edges[j] + self.y_edges[j + 1]) / 2.0,
        )
    }

    /// The pixel containing `(x, y)`, or `None` if the point is off the grid.
    pub fn locate(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        Some((locate_bin(&self.x_edges, x)?, locate_bin(&self.y_edges, y)?))
    }
}

fn locate_bin(edges: &[f64], value: f64) -> Option<usize> {
    let last = *edges.last()?;
    if !value.is_finite() || value < edges[0] || value > last {
        return None;
    }
    if value == last {
        return Some(edges.len() - 2);
    }
    // first edge strictly greater than value, minus one
    Some(edges.partition_point(|&e| e <= value) - 1)
}

/// Per-pixel statistics of a set of samples.
///
/// Pixels without exposure have NaN mean and variance.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    /// weighted mean of the samples in each pixel
    pub mean: Array2<f64>,
    /// weighted variance of the samples in each pixel
    pub variance: Array2<f64>,
    /// sum of sample weights in each pixel
    pub exposure: Array2<f64>,
}

impl Image {
    /// Whether pixel `idx` received any samples.
    pub fn is_valid(&self, idx: (usize, usize)) -> bool {
        self.exposure[idx] > 0.0
    }

    /// Iterate over `(pixel, mean, variance)` of all valid pixels.
    pub fn valid_pixels(&self) -> impl Iterator<Item = ((usize, usize), f64, f64)> + '_ {
        self.exposure
            .indexed_iter()
            .filter(|(_, exposure)| **exposure > 0.0)
            .map(|(idx, _)| (idx, self.mean[idx], self.variance[idx]))
    }
}

/// Bin `(x, y, value, weight)` samples onto `grid` and compute the weighted
/// mean, variance and exposure of each pixel.
///
/// Samples falling outside the grid, or with non-finite values, are ignored.
/// When `weight` is `None` every sample counts once.
///
/// # Errors
///
/// Will return [`ImageError::BadArrayShape`] if `y`, `value` or `weight` have
/// a different length than `x`.
///
/// # Examples
///
/// ```rust
/// use driftscan::image::{accumulate, PixelGrid};
///
/// let grid = PixelGrid::regular((0.0, 2.0), 2, (0.0, 1.0), 1).unwrap();
/// let image = accumulate(&[0.5, 0.5, 1.5], &[0.5, 0.5, 0.5], &[1.0, 3.0, 5.0], None, &grid).unwrap();
///
/// assert_eq!(image.mean[(0, 0)], 2.0);
/// assert_eq!(image.variance[(0, 0)], 1.0);
/// assert_eq!(image.exposure[(1, 0)], 1.0);
/// ```
pub fn accumulate(
    x: &[f64],
    y: &[f64],
    value: &[f64],
    weight: Option<&[f64]>,
    grid: &PixelGrid,
) -> Result<Image, ImageError> {
    let check_len = |argument: &str, len: usize| {
        if len != x.len() {
            return Err(BadArrayShape {
                argument: argument.into(),
                function: "accumulate".into(),
                expected: format!("({},)", x.len()),
                received: format!("({},)", len),
            });
        }
        Ok(())
    };
    check_len("y", y.len())?;
    check_len("value", value.len())?;
    if let Some(weight) = weight {
        check_len("weight", weight.len())?;
    }

    let pixels = x
        .iter()
        .zip(y)
        .map(|(&x, &y)| grid.locate(x, y))
        .collect::<Vec<_>>();
    Ok(accumulate_indexed(&pixels, value, weight, grid.shape()))
}

/// Like [`accumulate`], for samples whose pixel has already been located.
///
/// `pixels`, `value` and `weight` must have the same length.
pub fn accumulate_indexed(
    pixels: &[Option<(usize, usize)>],
    value: &[f64],
    weight: Option<&[f64]>,
    shape: (usize, usize),
) -> Image {
    let mut sum_w = Array2::<f64>::zeros(shape);
    let mut sum_wv = Array2::<f64>::zeros(shape);
    let mut sum_wv2 = Array2::<f64>::zeros(shape);

    for (sample_idx, (pixel, &v)) in izip!(pixels, value).enumerate() {
        let (Some(pixel), true) = (*pixel, v.is_finite()) else {
            continue;
        };
        let w = weight.map_or(1.0, |weight| weight[sample_idx]);
        if !(w > 0.0) {
            continue;
        }
        sum_w[pixel] += w;
        sum_wv[pixel] += w * v;
        sum_wv2[pixel] += w * v * v;
    }

    let mut mean = Array2::<f64>::from_elem(shape, f64::NAN);
    let mut variance = Array2::<f64>::from_elem(shape, f64::NAN);
    for (pix_mean, pix_var, &w, &wv, &wv2) in izip!(
        mean.iter_mut(),
        variance.iter_mut(),
        sum_w.iter(),
        sum_wv.iter(),
        sum_wv2.iter()
    ) {
        if w > 0.0 {
            *pix_mean = wv / w;
            // rounding can push a single-valued pixel slightly negative
            *pix_var = (wv2 / w - *pix_mean * *pix_mean).max(0.0);
        }
    }

    Image {
        mean,
        variance,
        exposure: sum_w,
    }
}
