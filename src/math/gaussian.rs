//! N-dimensional Gaussian random variables with value semantics.
//!
//! The pipeline passes fair-price estimates around as `Gaussian`s and
//! combines noisy observation channels by intersecting them (multiplying
//! PDFs). Covariances are treated as symmetric PSD; every inverse in here
//! is the SVD pseudo-inverse so rank-deficient covariance degrades
//! gracefully instead of blowing up.

use std::fmt;
use std::ops::BitAnd;

use nalgebra::{DMatrix, DVector};
use statrs::distribution::{ContinuousCDF, Normal};

/// Finite stand-in for an infinitely-uncertain dimension. Large enough to
/// be ignored by any intersection, small enough to keep matrix arithmetic
/// free of NaNs.
pub const INF_VARIANCE: f64 = 1e100;

/// Tolerance below which singular values are treated as zero.
const PINV_EPS: f64 = 1e-12;

/// Guard for direction normalisation.
const GRADIENT_EPS: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GaussianError {
    /// Operands live in different spaces.
    DimensionMismatch { left: usize, right: usize },
    /// The underlying decomposition failed to converge.
    Numerical(&'static str),
}

impl fmt::Display for GaussianError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GaussianError::DimensionMismatch { left, right } => {
                write!(f, "gaussian dimension mismatch: {left} vs {right}")
            }
            GaussianError::Numerical(what) => write!(f, "gaussian numerical failure: {what}"),
        }
    }
}

impl std::error::Error for GaussianError {}

/// A (possibly multivariate) Gaussian, freely copied around the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Gaussian {
    mean: DVector<f64>,
    covariance: DMatrix<f64>,
}

impl Gaussian {
    /// Covariance must be square and match the mean's dimension.
    pub fn new(mean: DVector<f64>, covariance: DMatrix<f64>) -> Result<Self, GaussianError> {
        if covariance.nrows() != mean.len() || covariance.ncols() != mean.len() {
            return Err(GaussianError::DimensionMismatch {
                left: mean.len(),
                right: covariance.nrows().max(covariance.ncols()),
            });
        }
        Ok(Self { mean, covariance })
    }

    /// Independent dimensions with the given per-component variances.
    pub fn diagonal(mean: DVector<f64>, variances: DVector<f64>) -> Result<Self, GaussianError> {
        if mean.len() != variances.len() {
            return Err(GaussianError::DimensionMismatch {
                left: mean.len(),
                right: variances.len(),
            });
        }
        let covariance = DMatrix::from_diagonal(&variances);
        Ok(Self { mean, covariance })
    }

    pub fn scalar(mean: f64, variance: f64) -> Self {
        Self {
            mean: DVector::from_element(1, mean),
            covariance: DMatrix::from_element(1, 1, variance),
        }
    }

    /// The zero-dimensional Gaussian, identity for `intersect` and `sum`.
    pub fn empty() -> Self {
        Self {
            mean: DVector::zeros(0),
            covariance: DMatrix::zeros(0, 0),
        }
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    /// Per-component variances (the covariance diagonal).
    pub fn variances(&self) -> DVector<f64> {
        self.covariance.diagonal()
    }

    pub fn stddev(&self) -> DVector<f64> {
        self.variances().map(f64::sqrt)
    }

    fn check_dim(&self, other: &Gaussian) -> Result<(), GaussianError> {
        if self.dim() != other.dim() {
            return Err(GaussianError::DimensionMismatch {
                left: self.dim(),
                right: other.dim(),
            });
        }
        Ok(())
    }

    fn pinv(matrix: &DMatrix<f64>) -> Result<DMatrix<f64>, GaussianError> {
        matrix
            .clone()
            .pseudo_inverse(PINV_EPS)
            .map_err(GaussianError::Numerical)
    }

    /// Multiplies the two PDFs and renormalises (Bayesian combination of
    /// two noisy observations of the same quantity).
    pub fn intersect2(&self, other: &Gaussian) -> Result<Gaussian, GaussianError> {
        self.check_dim(other)?;
        let sum_inv = Self::pinv(&(&self.covariance + &other.covariance))?;
        let covariance = &self.covariance * &sum_inv * &other.covariance;
        let mean = &other.covariance * &sum_inv * &self.mean
            + &self.covariance * &sum_inv * &other.mean;
        Ok(Gaussian {
            mean,
            covariance: symmetrize(covariance),
        })
    }

    /// Intersection of any number of Gaussians; the empty input yields the
    /// zero-dimensional Gaussian.
    pub fn intersect<I>(xs: I) -> Result<Gaussian, GaussianError>
    where
        I: IntoIterator<Item = Gaussian>,
    {
        let mut iter = xs.into_iter();
        let Some(first) = iter.next() else {
            return Ok(Gaussian::empty());
        };
        iter.try_fold(first, |acc, x| acc.intersect2(&x))
    }

    /// Sum of independent Gaussian variables: means and covariances add.
    pub fn sum<I>(xs: I) -> Result<Gaussian, GaussianError>
    where
        I: IntoIterator<Item = Gaussian>,
    {
        let mut iter = xs.into_iter();
        let Some(first) = iter.next() else {
            return Ok(Gaussian::empty());
        };
        iter.try_fold(first, |acc, x| {
            acc.check_dim(&x)?;
            Ok(Gaussian {
                mean: acc.mean + x.mean,
                covariance: acc.covariance + x.covariance,
            })
        })
    }

    /// Component-wise scale: μ ← μ⊙s, Σ ← diag(s)·Σ·diag(s).
    pub fn scale_vec(&self, s: &DVector<f64>) -> Result<Gaussian, GaussianError> {
        if s.len() != self.dim() {
            return Err(GaussianError::DimensionMismatch {
                left: self.dim(),
                right: s.len(),
            });
        }
        let d = DMatrix::from_diagonal(s);
        Ok(Gaussian {
            mean: self.mean.component_mul(s),
            covariance: &d * &self.covariance * &d,
        })
    }

    /// Uniform scalar scale.
    pub fn scale(&self, s: f64) -> Gaussian {
        Gaussian {
            mean: &self.mean * s,
            covariance: &self.covariance * (s * s),
        }
    }

    /// Shift every component's mean by a scalar.
    pub fn shift(&self, offset: f64) -> Gaussian {
        Gaussian {
            mean: self.mean.add_scalar(offset),
            covariance: self.covariance.clone(),
        }
    }

    /// Shift the mean by a vector.
    pub fn shift_vec(&self, offset: &DVector<f64>) -> Result<Gaussian, GaussianError> {
        if offset.len() != self.dim() {
            return Err(GaussianError::DimensionMismatch {
                left: self.dim(),
                right: offset.len(),
            });
        }
        Ok(Gaussian {
            mean: &self.mean + offset,
            covariance: self.covariance.clone(),
        })
    }

    /// Independent sum of two Gaussians (binary form of [`Gaussian::sum`]).
    pub fn add(&self, other: &Gaussian) -> Result<Gaussian, GaussianError> {
        self.check_dim(other)?;
        Ok(Gaussian {
            mean: &self.mean + &other.mean,
            covariance: &self.covariance + &other.covariance,
        })
    }

    /// Independent difference; covariances still add.
    pub fn sub(&self, other: &Gaussian) -> Result<Gaussian, GaussianError> {
        self.check_dim(other)?;
        Ok(Gaussian {
            mean: &self.mean - &other.mean,
            covariance: &self.covariance + &other.covariance,
        })
    }

    /// Gaussian approximation of the product of two independent variables.
    /// Matches the true mean and variance per component; exact bookkeeping
    /// only holds for diagonal covariance, which is what the strategies use.
    pub fn mul_iid(&self, other: &Gaussian) -> Result<Gaussian, GaussianError> {
        self.check_dim(other)?;
        let va = self.variances();
        let vb = other.variances();
        let ma2 = self.mean.component_mul(&self.mean);
        let mb2 = other.mean.component_mul(&other.mean);
        let mean = self.mean.component_mul(&other.mean);
        let variance = (va + &mb2).component_mul(&(vb + &ma2)) - ma2.component_mul(&mb2);
        Gaussian::diagonal(mean, variance)
    }

    /// Marginal over the given component indices (valid for the diagonal
    /// covariances produced by the per-channel prediction step; off-block
    /// covariance with the dropped components is discarded).
    pub fn marginal(&self, indices: &[usize]) -> Result<Gaussian, GaussianError> {
        if indices.iter().any(|&i| i >= self.dim()) {
            return Err(GaussianError::DimensionMismatch {
                left: self.dim(),
                right: indices.len(),
            });
        }
        let mean = DVector::from_iterator(indices.len(), indices.iter().map(|&i| self.mean[i]));
        let covariance = DMatrix::from_fn(indices.len(), indices.len(), |r, c| {
            self.covariance[(indices[r], indices[c])]
        });
        Ok(Gaussian { mean, covariance })
    }

    /// Squared Mahalanobis distance of `x` from the mean.
    fn mahalanobis_sq(&self, x: &DVector<f64>) -> Result<f64, GaussianError> {
        if x.len() != self.dim() {
            return Err(GaussianError::DimensionMismatch {
                left: self.dim(),
                right: x.len(),
            });
        }
        let delta = x - &self.mean;
        let pinv = Self::pinv(&self.covariance)?;
        Ok((delta.transpose() * pinv * &delta)[(0, 0)])
    }

    /// Mahalanobis distance (the multivariate z-score).
    pub fn z_score(&self, x: &DVector<f64>) -> Result<f64, GaussianError> {
        Ok(self.mahalanobis_sq(x)?.max(0.0).sqrt())
    }

    /// Density at `x`, using the pseudo-determinant on the covariance's
    /// support when it is rank-deficient.
    pub fn pdf(&self, x: &DVector<f64>) -> Result<f64, GaussianError> {
        let z2 = self.mahalanobis_sq(x)?;
        let svd = self.covariance.clone().svd(false, false);
        let mut rank = 0usize;
        let mut pseudo_det = 1.0;
        for sv in svd.singular_values.iter() {
            if *sv > PINV_EPS {
                rank += 1;
                pseudo_det *= sv;
            }
        }
        let norm = ((2.0 * std::f64::consts::PI).powi(rank as i32) * pseudo_det).sqrt();
        Ok((-0.5 * z2).exp() / norm)
    }

    /// P(X ≤ x), taken per marginal component and multiplied. Exact for the
    /// diagonal covariances used in this pipeline.
    pub fn cdf(&self, x: &DVector<f64>) -> Result<f64, GaussianError> {
        self.cdf_with(x, None)
    }

    /// P(a ≤ X ≤ b) per marginal component.
    pub fn cdf_between(&self, a: &DVector<f64>, b: &DVector<f64>) -> Result<f64, GaussianError> {
        self.cdf_with(b, Some(a))
    }

    fn cdf_with(&self, upper: &DVector<f64>, lower: Option<&DVector<f64>>) -> Result<f64, GaussianError> {
        if upper.len() != self.dim() || lower.map_or(false, |l| l.len() != self.dim()) {
            return Err(GaussianError::DimensionMismatch {
                left: self.dim(),
                right: upper.len(),
            });
        }
        let mut p = 1.0;
        for i in 0..self.dim() {
            let sigma = self.covariance[(i, i)].max(0.0).sqrt();
            let upper_p = marginal_cdf(self.mean[i], sigma, upper[i]);
            let lower_p = match lower {
                Some(l) => marginal_cdf(self.mean[i], sigma, l[i]),
                None => 0.0,
            };
            p *= (upper_p - lower_p).max(0.0);
        }
        Ok(p)
    }

    /// ∂ log p(x) / ∂x = −Σ⁺ (x − μ). Points toward higher likelihood.
    pub fn gradient(&self, x: &DVector<f64>) -> Result<DVector<f64>, GaussianError> {
        if x.len() != self.dim() {
            return Err(GaussianError::DimensionMismatch {
                left: self.dim(),
                right: x.len(),
            });
        }
        let pinv = Self::pinv(&self.covariance)?;
        Ok(-(pinv * (x - &self.mean)))
    }

    /// Unit-norm gradient, or the zero vector when the gradient is too
    /// small to give a direction.
    pub fn gradient_direction(&self, x: &DVector<f64>) -> Result<DVector<f64>, GaussianError> {
        let g = self.gradient(x)?;
        let norm = g.norm();
        if norm < GRADIENT_EPS {
            return Ok(DVector::zeros(self.dim()));
        }
        Ok(g / norm)
    }
}

impl BitAnd for &Gaussian {
    type Output = Result<Gaussian, GaussianError>;

    fn bitand(self, rhs: &Gaussian) -> Self::Output {
        self.intersect2(rhs)
    }
}

fn symmetrize(m: DMatrix<f64>) -> DMatrix<f64> {
    let mt = m.transpose();
    (m + mt) * 0.5
}

fn marginal_cdf(mean: f64, sigma: f64, x: f64) -> f64 {
    if sigma <= 0.0 {
        // Degenerate marginal: a point mass at the mean.
        return if x >= mean { 1.0 } else { 0.0 };
    }
    match Normal::new(mean, sigma) {
        Ok(n) => n.cdf(x),
        // Extreme sigma (the INF_VARIANCE sentinel) leaves the CDF flat.
        Err(_) => 0.5,
    }
}
