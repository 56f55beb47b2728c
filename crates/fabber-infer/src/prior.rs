//! Parameter priors.
//!
//! Each model parameter carries one prior kind, selected by a character
//! code: `N` (fixed normal), `I` (image: voxelwise mean from an external
//! volume), `A` (automatic relevance determination), and the spatial kinds
//! `M`/`m` (shrinkage / shrinkage with Dirichlet boundary) and `P`/`p`
//! (evidence-optimised / first-order-restricted).
//!
//! Every kind reduces, per voxel, to an effective Gaussian contribution
//! (μ₀, λ₀) consumed by the VB update. Spatial kinds are *derived state*:
//! their per-voxel contributions are rewritten by the spatial coordinator
//! between sweeps, and fall back to the parameter's base prior until the
//! first rewrite.

use nalgebra::{DMatrix, DVector};

use fabber_core::{DistParams, FabberError, FabberResult};

/// Character code for the fixed normal prior.
pub const PRIOR_CODE_NORMAL: char = 'N';
/// Character code for the image prior.
pub const PRIOR_CODE_IMAGE: char = 'I';
/// Character code for the ARD prior.
pub const PRIOR_CODE_ARD: char = 'A';
/// Character code for the spatial shrinkage prior.
pub const PRIOR_CODE_SPATIAL_M: char = 'M';
/// Character code for the shrinkage prior with Dirichlet boundary.
pub const PRIOR_CODE_SPATIAL_M_DIRICHLET: char = 'm';
/// Character code for the evidence-optimised spatial prior.
pub const PRIOR_CODE_SPATIAL_P: char = 'P';
/// Character code for the first-order-restricted spatial prior.
pub const PRIOR_CODE_SPATIAL_P_FIRST_ORDER: char = 'p';

/// Floor on ARD effective precision denominators.
const ARD_DENOM_FLOOR: f64 = 1e-12;

/// The kind of prior attached to one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorKind {
    /// Fixed Gaussian from the model's hard-coded distribution
    Normal,
    /// Voxelwise mean supplied by an external image volume
    Image,
    /// Automatic relevance determination
    Ard,
    /// Spatial shrinkage over first-order neighbours
    SpatialM,
    /// Shrinkage with Dirichlet boundary condition at lattice edges
    SpatialMDirichlet,
    /// Penny-style evidence-optimised spatial prior over the full kernel
    SpatialP,
    /// Evidence-optimised prior restricted to first-order neighbourhoods
    SpatialPFirstOrder,
}

impl PriorKind {
    /// Parse one character code.
    pub fn from_code(code: char) -> FabberResult<Self> {
        match code {
            PRIOR_CODE_NORMAL => Ok(Self::Normal),
            PRIOR_CODE_IMAGE => Ok(Self::Image),
            PRIOR_CODE_ARD => Ok(Self::Ard),
            PRIOR_CODE_SPATIAL_M => Ok(Self::SpatialM),
            PRIOR_CODE_SPATIAL_M_DIRICHLET => Ok(Self::SpatialMDirichlet),
            PRIOR_CODE_SPATIAL_P => Ok(Self::SpatialP),
            PRIOR_CODE_SPATIAL_P_FIRST_ORDER => Ok(Self::SpatialPFirstOrder),
            other => Err(FabberError::invalid_option(
                "param-spatial-priors",
                other.to_string(),
                "known prior codes are N, I, A, M, m, P, p",
            )),
        }
    }

    /// Whether this kind is coupled across voxels.
    #[must_use]
    pub fn is_spatial(&self) -> bool {
        matches!(
            self,
            Self::SpatialM | Self::SpatialMDirichlet | Self::SpatialP | Self::SpatialPFirstOrder
        )
    }

    /// Whether this kind uses the shrinkage (neighbour-averaging) update.
    #[must_use]
    pub fn is_shrinkage(&self) -> bool {
        matches!(self, Self::SpatialM | Self::SpatialMDirichlet)
    }
}

/// Parse a prior-type string, one character per parameter.
///
/// If the string ends with `+`, its final character is repeated for the
/// remaining parameters. An empty string gives every parameter the given
/// default kind.
pub fn parse_prior_types(
    spec: &str,
    n_params: usize,
    default: PriorKind,
) -> FabberResult<Vec<PriorKind>> {
    if spec.is_empty() {
        return Ok(vec![default; n_params]);
    }
    let chars: Vec<char> = spec.chars().collect();
    let (body, repeat_last) = match chars.last() {
        Some('+') => (&chars[..chars.len() - 1], true),
        _ => (&chars[..], false),
    };
    if body.is_empty() {
        return Err(FabberError::invalid_option(
            "param-spatial-priors",
            spec,
            "no prior code before '+'",
        ));
    }
    let mut kinds = Vec::with_capacity(n_params);
    for p in 0..n_params {
        let code = if p < body.len() {
            body[p]
        } else if repeat_last {
            body[body.len() - 1]
        } else {
            return Err(FabberError::invalid_option(
                "param-spatial-priors",
                spec,
                format!("{} codes given for {n_params} parameters", body.len()),
            ));
        };
        kinds.push(PriorKind::from_code(code)?);
    }
    if body.len() > n_params {
        return Err(FabberError::invalid_option(
            "param-spatial-priors",
            spec,
            format!("{} codes given for {n_params} parameters", body.len()),
        ));
    }
    Ok(kinds)
}

/// The effective Gaussian prior contribution for one parameter at one
/// voxel.
#[derive(Debug, Clone, Copy)]
pub struct EffectivePrior {
    /// Prior mean μ₀
    pub mean: f64,
    /// Prior precision λ₀
    pub precision: f64,
}

/// Prior state for one parameter across all voxels.
#[derive(Debug, Clone)]
pub struct ParamPrior {
    /// The prior kind
    pub kind: PriorKind,
    /// Base prior in fabber space, from the model definition
    pub base: DistParams,
    /// Per-voxel prior means for image priors (fabber space)
    pub image_means: Option<DVector<f64>>,
    /// Spatial precision magnitude ρ
    pub rho: f64,
    /// Spatial correlation length δ
    pub delta: f64,
    /// Per-voxel spatial prior means, rewritten between sweeps
    pub spatial_means: Option<DVector<f64>>,
    /// Per-voxel spatial prior precisions, rewritten between sweeps
    pub spatial_precisions: Option<DVector<f64>>,
}

impl ParamPrior {
    /// A prior with no spatial state yet.
    #[must_use]
    pub fn new(kind: PriorKind, base: DistParams) -> Self {
        Self {
            kind,
            base,
            image_means: None,
            rho: 1.0,
            delta: 1.0,
            spatial_means: None,
            spatial_precisions: None,
        }
    }

    /// Attach the per-voxel means of an image prior.
    pub fn with_image_means(mut self, means: DVector<f64>) -> Self {
        self.image_means = Some(means);
        self
    }

    /// Install freshly computed spatial contributions for every voxel.
    pub fn set_spatial(&mut self, means: DVector<f64>, precisions: DVector<f64>) {
        self.spatial_means = Some(means);
        self.spatial_precisions = Some(precisions);
    }

    /// The effective (μ₀, λ₀) for this parameter at `voxel`.
    ///
    /// `param_mean` and `param_var` are the current posterior marginal for
    /// this parameter at this voxel, used by the ARD update
    /// λ₀ = 1/(μ² + σ²).
    pub fn effective(
        &self,
        voxel: usize,
        param_mean: f64,
        param_var: f64,
    ) -> FabberResult<EffectivePrior> {
        match self.kind {
            PriorKind::Normal => Ok(EffectivePrior {
                mean: self.base.mean(),
                precision: self.base.prec(),
            }),
            PriorKind::Image => {
                let means = self.image_means.as_ref().ok_or_else(|| {
                    FabberError::missing_option("prior-image-<param>")
                })?;
                Ok(EffectivePrior {
                    mean: means[voxel],
                    precision: self.base.prec(),
                })
            }
            PriorKind::Ard => Ok(EffectivePrior {
                mean: 0.0,
                precision: 1.0
                    / (param_mean * param_mean + param_var).max(ARD_DENOM_FLOOR),
            }),
            _ => match (&self.spatial_means, &self.spatial_precisions) {
                (Some(means), Some(precisions)) if precisions[voxel] > 0.0 => {
                    Ok(EffectivePrior {
                        mean: means[voxel],
                        precision: precisions[voxel],
                    })
                }
                // Before the first spatial rewrite, or for an isolated
                // voxel with no neighbours, fall back to the base prior
                _ => Ok(EffectivePrior {
                    mean: self.base.mean(),
                    precision: self.base.prec(),
                }),
            },
        }
    }
}

/// Assemble the effective prior mean vector and diagonal precision for one
/// voxel across all parameters.
pub fn assemble_priors(
    priors: &[ParamPrior],
    voxel: usize,
    posterior_mean: &DVector<f64>,
    posterior_cov: &DMatrix<f64>,
) -> FabberResult<(DVector<f64>, DVector<f64>)> {
    let p = priors.len();
    let mut mean = DVector::zeros(p);
    let mut precision = DVector::zeros(p);
    for (i, prior) in priors.iter().enumerate() {
        let eff = prior.effective(voxel, posterior_mean[i], posterior_cov[(i, i)])?;
        mean[i] = eff.mean;
        precision[i] = eff.precision;
    }
    Ok((mean, precision))
}
