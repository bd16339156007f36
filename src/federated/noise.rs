//! Noise sources for local updates.

use std::f64::consts::PI;

use rand::Rng;

/// Source of zero-mean noise with a requested standard deviation.
pub trait NoiseSource: Send + Sync + std::fmt::Debug {
    fn sample(&self, std_dev: f64) -> f64;
}

/// Gaussian noise via the Box-Muller transform over `rand` uniforms.
#[derive(Debug, Default, Clone, Copy)]
pub struct GaussianNoise;

impl NoiseSource for GaussianNoise {
    fn sample(&self, std_dev: f64) -> f64 {
        if !(std_dev.is_finite() && std_dev > 0.0) {
            return 0.0;
        }
        let mut rng = rand::thread_rng();
        // u1 in (0, 1] keeps ln() finite.
        let u1: f64 = 1.0 - rng.gen::<f64>();
        let u2: f64 = rng.gen::<f64>();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
        z * std_dev
    }
}

/// Adds the same offset every time, scaled by the requested deviation.
///
/// `ConstantNoise(0.0)` disables noise entirely; large factors are useful
/// for exercising clipping.
#[derive(Debug, Clone, Copy)]
pub struct ConstantNoise(pub f64);

impl NoiseSource for ConstantNoise {
    fn sample(&self, std_dev: f64) -> f64 {
        self.0 * std_dev
    }
}
