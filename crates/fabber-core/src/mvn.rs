//! Multivariate Gaussian distribution with dual representation.
//!
//! [`MvnDist`] stores a mean vector and *one* of covariance or precision as
//! the authoritative representation; the other is reconstructed lazily on
//! demand and cached until the next mutation. The representation state is
//! tracked explicitly so stale matrices can never be observed.
//!
//! Every path that writes a matrix symmetrises it as (M + Mᵀ)/2, and every
//! inversion goes through a Cholesky factorisation so that a non-SPD matrix
//! surfaces as a diagnostic [`FabberError::Numerical`] rather than silently
//! producing garbage.

use nalgebra::{Cholesky, DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{FabberError, FabberResult};

/// Which representation of the distribution is currently authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Repr {
    /// Covariance is up to date; precision may be stale.
    CovarianceCurrent,
    /// Precision is up to date; covariance may be stale.
    PrecisionCurrent,
    /// Both matrices agree.
    Both,
}

/// A multivariate Gaussian with lazily synchronised covariance/precision.
#[derive(Debug, Clone)]
pub struct MvnDist {
    mean: DVector<f64>,
    covariance: DMatrix<f64>,
    precision: DMatrix<f64>,
    repr: Repr,
}

/// Symmetrise a matrix in place as (M + Mᵀ)/2.
fn symmetrize(m: &mut DMatrix<f64>) {
    let n = m.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (m[(i, j)] + m[(j, i)]);
            m[(i, j)] = avg;
            m[(j, i)] = avg;
        }
    }
}

/// Invert an SPD matrix via Cholesky, reporting failure as a numerical error.
fn spd_inverse(m: &DMatrix<f64>, context: &str) -> FabberResult<DMatrix<f64>> {
    Cholesky::new(m.clone())
        .map(|c| c.inverse())
        .ok_or_else(|| {
            FabberError::numerical(format!("{context}: matrix is not positive definite"))
        })
}

impl MvnDist {
    /// A standard Gaussian of the given dimension: zero mean, identity
    /// covariance.
    #[must_use]
    pub fn new(n: usize) -> Self {
        Self {
            mean: DVector::zeros(n),
            covariance: DMatrix::identity(n, n),
            precision: DMatrix::identity(n, n),
            repr: Repr::Both,
        }
    }

    /// Construct from a mean and covariance matrix.
    pub fn from_mean_covariance(
        mean: DVector<f64>,
        covariance: DMatrix<f64>,
    ) -> FabberResult<Self> {
        let mut dist = Self::new(mean.len());
        dist.set_mean(mean)?;
        dist.set_covariance(covariance)?;
        Ok(dist)
    }

    /// Construct from a mean and precision matrix.
    pub fn from_mean_precision(mean: DVector<f64>, precision: DMatrix<f64>) -> FabberResult<Self> {
        let mut dist = Self::new(mean.len());
        dist.set_mean(mean)?;
        dist.set_precision(precision)?;
        Ok(dist)
    }

    /// Dimension of the distribution.
    #[must_use]
    pub fn n_params(&self) -> usize {
        self.mean.len()
    }

    /// The mean vector.
    #[must_use]
    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    /// Replace the mean vector. Does not touch either matrix.
    pub fn set_mean(&mut self, mean: DVector<f64>) -> FabberResult<()> {
        if mean.len() != self.mean.len() {
            return Err(FabberError::dimension_mismatch(
                "MVN mean",
                self.mean.len().to_string(),
                mean.len().to_string(),
            ));
        }
        self.mean = mean;
        Ok(())
    }

    /// Replace the covariance; the precision becomes stale.
    pub fn set_covariance(&mut self, mut covariance: DMatrix<f64>) -> FabberResult<()> {
        let n = self.mean.len();
        if covariance.nrows() != n || covariance.ncols() != n {
            return Err(FabberError::dimension_mismatch(
                "MVN covariance",
                format!("{n}x{n}"),
                format!("{}x{}", covariance.nrows(), covariance.ncols()),
            ));
        }
        symmetrize(&mut covariance);
        self.covariance = covariance;
        self.repr = Repr::CovarianceCurrent;
        Ok(())
    }

    /// Replace the precision; the covariance becomes stale.
    pub fn set_precision(&mut self, mut precision: DMatrix<f64>) -> FabberResult<()> {
        let n = self.mean.len();
        if precision.nrows() != n || precision.ncols() != n {
            return Err(FabberError::dimension_mismatch(
                "MVN precision",
                format!("{n}x{n}"),
                format!("{}x{}", precision.nrows(), precision.ncols()),
            ));
        }
        symmetrize(&mut precision);
        self.precision = precision;
        self.repr = Repr::PrecisionCurrent;
        Ok(())
    }

    /// The covariance matrix, reconstructing it from the precision if stale.
    pub fn covariance(&mut self) -> FabberResult<&DMatrix<f64>> {
        if self.repr == Repr::PrecisionCurrent {
            let mut cov = spd_inverse(&self.precision, "inverting MVN precision")?;
            symmetrize(&mut cov);
            self.covariance = cov;
            self.repr = Repr::Both;
        }
        Ok(&self.covariance)
    }

    /// The precision matrix, reconstructing it from the covariance if stale.
    pub fn precision(&mut self) -> FabberResult<&DMatrix<f64>> {
        if self.repr == Repr::CovarianceCurrent {
            let mut prec = spd_inverse(&self.covariance, "inverting MVN covariance")?;
            symmetrize(&mut prec);
            self.precision = prec;
            self.repr = Repr::Both;
        }
        Ok(&self.precision)
    }

    /// log |Σ| via the Cholesky factor of the covariance.
    pub fn log_det_covariance(&mut self) -> FabberResult<f64> {
        let cov = self.covariance()?.clone();
        let chol = Cholesky::new(cov).ok_or_else(|| {
            FabberError::numerical("log-determinant: covariance is not positive definite")
        })?;
        Ok(2.0 * chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>())
    }

    /// Block-diagonal combination of two independent Gaussians.
    pub fn concat(a: &mut MvnDist, b: &mut MvnDist) -> FabberResult<MvnDist> {
        let (na, nb) = (a.n_params(), b.n_params());
        let mut mean = DVector::zeros(na + nb);
        mean.rows_mut(0, na).copy_from(a.mean());
        mean.rows_mut(na, nb).copy_from(b.mean());

        let mut cov = DMatrix::zeros(na + nb, na + nb);
        cov.view_mut((0, 0), (na, na)).copy_from(a.covariance()?);
        cov.view_mut((na, na), (nb, nb)).copy_from(b.covariance()?);

        MvnDist::from_mean_covariance(mean, cov)
    }

    /// Marginal distribution over the given parameter indices.
    pub fn marginal(&mut self, indices: &[usize]) -> FabberResult<MvnDist> {
        let n = self.n_params();
        for &i in indices {
            if i >= n {
                return Err(FabberError::internal(format!(
                    "marginal index {i} out of range for {n}-dimensional MVN"
                )));
            }
        }
        let cov = self.covariance()?.clone();
        let k = indices.len();
        let mut sub_mean = DVector::zeros(k);
        let mut sub_cov = DMatrix::zeros(k, k);
        for (r, &i) in indices.iter().enumerate() {
            sub_mean[r] = self.mean[i];
            for (c, &j) in indices.iter().enumerate() {
                sub_cov[(r, c)] = cov[(i, j)];
            }
        }
        MvnDist::from_mean_covariance(sub_mean, sub_cov)
    }

    /// KL divergence KL(self ‖ other) between Gaussians of equal dimension.
    pub fn kl_divergence_from(&mut self, other: &mut MvnDist) -> FabberResult<f64> {
        let n = self.n_params();
        if other.n_params() != n {
            return Err(FabberError::dimension_mismatch(
                "KL divergence",
                n.to_string(),
                other.n_params().to_string(),
            ));
        }
        let log_det_self = self.log_det_covariance()?;
        let log_det_other = other.log_det_covariance()?;
        let prec_other = other.precision()?.clone();
        let cov_self = self.covariance()?;

        let trace = (&prec_other * cov_self).trace();
        let diff = other.mean() - self.mean();
        let maha = (prec_other * &diff).dot(&diff);

        Ok(0.5 * (trace + maha - n as f64 + log_det_other - log_det_self))
    }

    /// Draw one sample, for test support only.
    ///
    /// Uses the Cholesky factor of the covariance: x = μ + L·z with
    /// z ~ N(0, I).
    pub fn sample<R: Rng>(&mut self, rng: &mut R) -> FabberResult<DVector<f64>> {
        let n = self.n_params();
        let cov = self.covariance()?.clone();
        let chol = Cholesky::new(cov).ok_or_else(|| {
            FabberError::numerical("sampling: covariance is not positive definite")
        })?;
        let z = DVector::from_fn(n, |_, _| rng.sample::<f64, _>(StandardNormal));
        Ok(&self.mean + chol.l() * z)
    }

    /// Pack as the augmented symmetric matrix [[Σ, μ], [μᵀ, 1]], lower
    /// triangle row-wise.
    ///
    /// This is the layout stored per voxel in the `finalMVN` output volume
    /// (symmetric-matrix intent); length (n+1)(n+2)/2.
    pub fn pack_symmatrix(&mut self) -> FabberResult<DVector<f64>> {
        let n = self.n_params();
        let cov = self.covariance()?.clone();
        let mut packed = DVector::zeros((n + 1) * (n + 2) / 2);
        let mut k = 0;
        for i in 0..n {
            for j in 0..=i {
                packed[k] = cov[(i, j)];
                k += 1;
            }
        }
        for j in 0..n {
            packed[k] = self.mean[j];
            k += 1;
        }
        packed[k] = 1.0;
        Ok(packed)
    }

    /// Rebuild a distribution from the packing produced by
    /// [`MvnDist::pack_symmatrix`].
    pub fn unpack_symmatrix(packed: &DVector<f64>, n: usize) -> FabberResult<MvnDist> {
        let expected = (n + 1) * (n + 2) / 2;
        if packed.len() != expected {
            return Err(FabberError::dimension_mismatch(
                "packed MVN",
                expected.to_string(),
                packed.len().to_string(),
            ));
        }
        let mut cov = DMatrix::zeros(n, n);
        let mut k = 0;
        for i in 0..n {
            for j in 0..=i {
                cov[(i, j)] = packed[k];
                cov[(j, i)] = packed[k];
                k += 1;
            }
        }
        let mean = DVector::from_fn(n, |i, _| packed[k + i]);
        MvnDist::from_mean_covariance(mean, cov)
    }
}
