//! Covariance cache for spatial priors.
//!
//! Owns the V×V voxel distance matrix and memoises, keyed by the
//! correlation length δ: the spatial kernel K(δ) with Kᵢⱼ = exp(−Dᵢⱼ/δ),
//! its inverse, and the products (K⁻¹·C·K⁻¹, tr(K⁻¹·C)) for the currently
//! supplied covariance-ratio matrix C.
//!
//! δ keys are canonicalised to 9 significant digits before lookup, so the
//! cache tolerates the round-off drift of iterative δ searches. Entries are
//! immutable once inserted; the cache is cleared only by an explicit reset
//! (or, for the C-dependent products, when C itself is replaced).

use std::collections::BTreeMap;

use nalgebra::{Cholesky, DMatrix, DVector};
use tracing::debug;

use fabber_core::{FabberError, FabberResult};

/// Jitter added to the kernel diagonal when a first factorisation fails.
const KERNEL_JITTER: f64 = 1e-9;

/// How voxel-to-voxel distances are measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMeasure {
    /// Euclidean distance ("dist1")
    Euclidean,
    /// Squared Euclidean distance ("dist2")
    SquaredEuclidean,
    /// Manhattan distance ("mdist")
    Manhattan,
}

impl DistanceMeasure {
    /// Parse the `--distance-measure` option value.
    pub fn from_option(value: &str) -> FabberResult<Self> {
        match value {
            "dist1" => Ok(Self::Euclidean),
            "dist2" => Ok(Self::SquaredEuclidean),
            "mdist" => Ok(Self::Manhattan),
            other => Err(FabberError::invalid_option(
                "distance-measure",
                other,
                "value not recognized (dist1, dist2, mdist)",
            )),
        }
    }
}

/// A δ value canonicalised for use as a cache key.
///
/// Rounded to 9 significant digits; ordered so the map supports
/// nearest-in-range queries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaKey(f64);

impl DeltaKey {
    /// Canonicalise a δ value.
    #[must_use]
    pub fn new(delta: f64) -> Self {
        // Round-trip through a 9-significant-digit representation
        let canonical: f64 = format!("{delta:.8e}").parse().unwrap_or(delta);
        Self(canonical)
    }

    /// The canonical value.
    #[must_use]
    pub fn value(&self) -> f64 {
        self.0
    }
}

impl Eq for DeltaKey {}

impl PartialOrd for DeltaKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeltaKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Distance matrix plus δ-keyed kernel caches.
#[derive(Debug)]
pub struct CovarianceCache {
    distances: DMatrix<f64>,
    cinv: BTreeMap<DeltaKey, DMatrix<f64>>,
    ci_codist_ci: BTreeMap<DeltaKey, (DMatrix<f64>, f64)>,
    covar_ratio: Option<DMatrix<f64>>,
}

impl CovarianceCache {
    /// Compute the distance matrix for the given voxel coordinates and
    /// measure.
    #[must_use]
    pub fn new(coords: &[[i32; 3]], measure: DistanceMeasure) -> Self {
        let v = coords.len();
        let mut distances = DMatrix::zeros(v, v);
        for i in 0..v {
            for j in (i + 1)..v {
                let dx = f64::from(coords[i][0] - coords[j][0]);
                let dy = f64::from(coords[i][1] - coords[j][1]);
                let dz = f64::from(coords[i][2] - coords[j][2]);
                let d = match measure {
                    DistanceMeasure::Euclidean => (dx * dx + dy * dy + dz * dz).sqrt(),
                    DistanceMeasure::SquaredEuclidean => dx * dx + dy * dy + dz * dz,
                    DistanceMeasure::Manhattan => dx.abs() + dy.abs() + dz.abs(),
                };
                distances[(i, j)] = d;
                distances[(j, i)] = d;
            }
        }
        Self {
            distances,
            cinv: BTreeMap::new(),
            ci_codist_ci: BTreeMap::new(),
            covar_ratio: None,
        }
    }

    /// Number of voxels.
    #[must_use]
    pub fn n_voxels(&self) -> usize {
        self.distances.nrows()
    }

    /// The distance matrix.
    #[must_use]
    pub fn distances(&self) -> &DMatrix<f64> {
        &self.distances
    }

    /// The spatial kernel K(δ). Quick to compute, so not cached.
    #[must_use]
    pub fn kernel(&self, delta: f64) -> DMatrix<f64> {
        self.distances.map(|d| (-d / delta).exp())
    }

    /// log |K(δ)| via a Cholesky factorisation of the kernel.
    pub fn log_det_kernel(&self, delta: f64) -> FabberResult<f64> {
        let chol = self.factorize_kernel(delta)?;
        Ok(2.0 * chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>())
    }

    fn factorize_kernel(&self, delta: f64) -> FabberResult<Cholesky<f64, nalgebra::Dyn>> {
        let k = self.kernel(delta);
        if let Some(chol) = Cholesky::new(k.clone()) {
            return Ok(chol);
        }
        // One retry with diagonal jitter before promoting to a run error
        debug!("kernel factorisation failed at delta={delta}, retrying with jitter");
        let mut jittered = k;
        for i in 0..jittered.nrows() {
            jittered[(i, i)] += KERNEL_JITTER;
        }
        Cholesky::new(jittered).ok_or_else(|| {
            FabberError::numerical(format!(
                "spatial kernel K(delta) not positive definite at delta={delta}"
            ))
        })
    }

    /// K(δ)⁻¹, memoised by canonicalised δ.
    ///
    /// A failed factorisation is retried once with diagonal jitter; if the
    /// retry also fails the δ entry is left uncached and the failure
    /// surfaces as a numerical error.
    pub fn cinv(&mut self, delta: f64) -> FabberResult<&DMatrix<f64>> {
        let key = DeltaKey::new(delta);
        if !self.cinv.contains_key(&key) {
            let inverse = self.factorize_kernel(delta)?.inverse();
            self.cinv.insert(key, inverse);
        }
        Ok(&self.cinv[&key])
    }

    /// Replace the covariance-ratio matrix C, invalidating every cached
    /// C-dependent product.
    pub fn set_covariance_ratio(&mut self, ratio: DMatrix<f64>) -> FabberResult<()> {
        let v = self.n_voxels();
        if ratio.nrows() != v || ratio.ncols() != v {
            return Err(FabberError::dimension_mismatch(
                "covariance ratio",
                format!("{v}x{v}"),
                format!("{}x{}", ratio.nrows(), ratio.ncols()),
            ));
        }
        self.ci_codist_ci.clear();
        self.covar_ratio = Some(ratio);
        Ok(())
    }

    /// Convenience wrapper: set a diagonal covariance ratio.
    pub fn set_covariance_ratio_diagonal(&mut self, diag: &DVector<f64>) -> FabberResult<()> {
        self.set_covariance_ratio(DMatrix::from_diagonal(diag))
    }

    /// (K⁻¹·C·K⁻¹, tr(K⁻¹·C)) for the current covariance ratio C, memoised
    /// by canonicalised δ.
    pub fn ci_codist_ci(&mut self, delta: f64) -> FabberResult<(&DMatrix<f64>, f64)> {
        let key = DeltaKey::new(delta);
        if !self.ci_codist_ci.contains_key(&key) {
            let ratio = self.covar_ratio.clone().ok_or_else(|| {
                FabberError::internal("covariance ratio requested before being supplied")
            })?;
            let cinv = self.cinv(delta)?.clone();
            let ci_c = &cinv * &ratio;
            let trace = ci_c.trace();
            self.ci_codist_ci.insert(key, (ci_c * cinv, trace));
        }
        let (matrix, trace) = &self.ci_codist_ci[&key];
        Ok((matrix, *trace))
    }

    /// If a δ inside the open interval (lower, upper) is cached, return it.
    ///
    /// Used to seed local searches with a previously evaluated value.
    #[must_use]
    pub fn get_cached_in_range(&self, lower: f64, upper: f64) -> Option<f64> {
        self.cinv
            .range(DeltaKey::new(lower)..DeltaKey::new(upper))
            .map(|(k, _)| k.value())
            .find(|&d| d > lower && d < upper)
    }

    /// Drop every cached kernel product.
    pub fn reset(&mut self) {
        self.cinv.clear();
        self.ci_codist_ci.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn line(n: i32) -> Vec<[i32; 3]> {
        (0..n).map(|x| [x, 0, 0]).collect()
    }

    #[test]
    fn test_distance_measures() {
        let coords = vec![[0, 0, 0], [3, 4, 0]];
        let euclid = CovarianceCache::new(&coords, DistanceMeasure::Euclidean);
        assert_relative_eq!(euclid.distances()[(0, 1)], 5.0);

        let squared = CovarianceCache::new(&coords, DistanceMeasure::SquaredEuclidean);
        assert_relative_eq!(squared.distances()[(0, 1)], 25.0);

        let manhattan = CovarianceCache::new(&coords, DistanceMeasure::Manhattan);
        assert_relative_eq!(manhattan.distances()[(0, 1)], 7.0);
    }

    #[test]
    fn test_kernel_diagonal_is_one() {
        let cache = CovarianceCache::new(&line(3), DistanceMeasure::Euclidean);
        let k = cache.kernel(2.0);
        for i in 0..3 {
            assert_relative_eq!(k[(i, i)], 1.0);
        }
        assert_relative_eq!(k[(0, 1)], (-0.5f64).exp());
    }

    #[test]
    fn test_cinv_matches_fresh_computation_bitwise() {
        let mut cache = CovarianceCache::new(&line(4), DistanceMeasure::Euclidean);
        let cached = cache.cinv(1.5).unwrap().clone();

        // Recompute from scratch through an identical code path
        let fresh = CovarianceCache::new(&line(4), DistanceMeasure::Euclidean)
            .cinv(1.5)
            .unwrap()
            .clone();
        assert_eq!(cached, fresh);

        // And the cached entry is actually an inverse of K
        let product = cache.kernel(1.5) * &cached;
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(product[(i, j)], expected, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_delta_key_canonicalisation_merges_near_equal_keys() {
        let mut cache = CovarianceCache::new(&line(3), DistanceMeasure::Euclidean);
        cache.cinv(1.0).unwrap();
        // A value equal to 9 significant digits hits the same entry
        cache.cinv(1.0 + 1e-13).unwrap();
        assert_eq!(cache.cinv.len(), 1);
    }

    #[test]
    fn test_cached_in_range() {
        let mut cache = CovarianceCache::new(&line(3), DistanceMeasure::Euclidean);
        cache.cinv(1.0).unwrap();
        cache.cinv(4.0).unwrap();

        assert_eq!(cache.get_cached_in_range(0.5, 2.0), Some(1.0));
        assert_eq!(cache.get_cached_in_range(2.0, 3.0), None);
        // Endpoints are excluded
        assert_eq!(cache.get_cached_in_range(1.0, 1.0 + 1e-12), None);
    }

    #[test]
    fn test_ci_codist_ci_requires_ratio_and_clears_on_replacement() {
        let mut cache = CovarianceCache::new(&line(3), DistanceMeasure::Euclidean);
        assert!(cache.ci_codist_ci(1.0).is_err());

        cache
            .set_covariance_ratio_diagonal(&DVector::from_element(3, 2.0))
            .unwrap();
        let (_, trace) = cache.ci_codist_ci(1.0).unwrap();
        // tr(K⁻¹·2I) = 2·tr(K⁻¹)
        let expected = 2.0 * cache.cinv(1.0).unwrap().trace();
        assert_relative_eq!(trace, expected, epsilon = 1e-12);

        cache
            .set_covariance_ratio_diagonal(&DVector::from_element(3, 1.0))
            .unwrap();
        assert!(cache.ci_codist_ci.is_empty());
    }

    #[test]
    fn test_log_det_kernel() {
        let cache = CovarianceCache::new(&line(2), DistanceMeasure::Euclidean);
        // 2x2 kernel [[1, a], [a, 1]] has determinant 1 - a²
        let a = (-1.0f64 / 2.0).exp();
        assert_relative_eq!(
            cache.log_det_kernel(2.0).unwrap(),
            (1.0 - a * a).ln(),
            epsilon = 1e-12
        );
    }
}
