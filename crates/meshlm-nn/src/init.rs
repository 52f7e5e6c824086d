// Weight initialization scales
//
// Projections draw their weights from N(0, std). The base std is 0.02 and two
// optional corrections apply:
//
//   scale_by_depth   × 1/√n_layer, only on projections that feed a residual
//                    output (attention output, c_proj)
//   scale_by_in      × 1/√(input feature count), on every projection

/// Base std of projection weights.
pub const DEFAULT_STD: f64 = 0.02;

/// Init settings shared by every projection of a model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InitConfig {
    pub std: f64,
    pub scale_by_depth: bool,
    pub scale_by_in: bool,
    pub n_layer: usize,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            std: DEFAULT_STD,
            scale_by_depth: false,
            scale_by_in: false,
            n_layer: 1,
        }
    }
}

impl InitConfig {
    /// Std for a projection reading `in_features` scalars per output.
    /// `residual` marks projections that feed a residual output.
    pub fn std_for(&self, in_features: usize, residual: bool) -> f64 {
        let mut std = self.std;
        if self.scale_by_depth && residual {
            std /= (self.n_layer.max(1) as f64).sqrt();
        }
        if self.scale_by_in {
            std /= (in_features.max(1) as f64).sqrt();
        }
        std
    }
}
