//! # Calculator — the numerical capability consumed by workers
//!
//! ## Responsibility
//! Define the [`Calculator`] trait (potential energy, forces, stress for a
//! [`Structure`]) and the [`CalculatorRegistry`] mapping model names to
//! factory functions, resolved once at worker startup.
//!
//! ## NOT Responsible For
//! - Request routing (see: broker)
//! - Serving loop and heartbeats (see: worker)
//!
//! Built-in implementations:
//! - [`LennardJones`] — classic 12-6 pair potential, treated as an
//!   isolated cluster (no periodic images)
//! - [`Constant`] — fixed-result calculator with a simulated delay, for
//!   pipeline tests and demos

use crate::protocol::Structure;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by calculator loading or evaluation.
#[derive(Error, Debug)]
pub enum CalculatorError {
    /// The calculator could not be constructed. Fatal at worker startup.
    #[error("calculator load failed: {0}")]
    Load(String),

    /// A property evaluation failed. Converted by the worker into a
    /// failure response; never fatal.
    #[error("calculation failed: {0}")]
    Failed(String),
}

/// A model that can evaluate properties of an atomic structure.
///
/// Implementations are resolved by name through a [`CalculatorRegistry`]
/// and live for the whole worker process. Evaluation is CPU-bound and
/// synchronous; the worker moves calls onto the blocking pool.
pub trait Calculator: Send + Sync {
    /// Potential energy in eV.
    ///
    /// # Errors
    ///
    /// [`CalculatorError::Failed`] when the model cannot evaluate the
    /// structure.
    fn potential_energy(&self, structure: &Structure) -> Result<f64, CalculatorError>;

    /// Forces in eV/Å, one 3-vector per atom.
    ///
    /// # Errors
    ///
    /// [`CalculatorError::Failed`] when the model cannot evaluate the
    /// structure.
    fn forces(&self, structure: &Structure) -> Result<Vec<[f64; 3]>, CalculatorError>;

    /// Voigt stress `[xx, yy, zz, yz, xz, xy]` in eV/Å³.
    ///
    /// # Errors
    ///
    /// [`CalculatorError::Failed`] when the model cannot evaluate the
    /// structure (e.g. a degenerate cell).
    fn stress(&self, structure: &Structure) -> Result<[f64; 6], CalculatorError>;
}

/// Factory producing a calculator instance. Construction may be
/// expensive (model weights, parameter tables); it runs once per worker.
pub type CalculatorFactory =
    Box<dyn Fn() -> Result<Arc<dyn Calculator>, CalculatorError> + Send + Sync>;

/// Registry of calculator factories keyed by model name.
///
/// The worker binary resolves its model name here at startup; an unknown
/// name aborts startup with the list of known names.
#[derive(Default)]
pub struct CalculatorRegistry {
    factories: BTreeMap<String, CalculatorFactory>,
}

impl CalculatorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in calculators (`lj`,
    /// `constant`).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("lj", || Ok(Arc::new(LennardJones::default())));
        registry.register("constant", || Ok(Arc::new(Constant::default())));
        registry
    }

    /// Register a factory under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Arc<dyn Calculator>, CalculatorError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Construct the calculator registered under `name`.
    ///
    /// # Errors
    ///
    /// [`CalculatorError::Load`] for unknown names (the message lists the
    /// known ones) or when the factory itself fails.
    pub fn create(&self, name: &str) -> Result<Arc<dyn Calculator>, CalculatorError> {
        match self.factories.get(name) {
            Some(factory) => factory(),
            None => Err(CalculatorError::Load(format!(
                "unknown model '{name}'; known models: {:?}",
                self.names()
            ))),
        }
    }

    /// Registered model names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

/// Classic 12-6 Lennard-Jones pair potential.
///
/// `E = Σ_{i<j} 4ε[(σ/r)¹² − (σ/r)⁶]` for pairs within `cutoff`.
/// Structures are treated as isolated clusters; the cell is used only
/// for the stress volume.
#[derive(Debug, Clone)]
pub struct LennardJones {
    /// Well depth ε in eV.
    pub epsilon: f64,
    /// Zero-crossing distance σ in Å.
    pub sigma: f64,
    /// Pair cutoff radius in Å.
    pub cutoff: f64,
}

impl Default for LennardJones {
    fn default() -> Self {
        Self {
            epsilon: 1.0,
            sigma: 1.0,
            cutoff: 3.0,
        }
    }
}

impl LennardJones {
    /// Pair energy at squared distance `r2`.
    fn pair_energy(&self, r2: f64) -> f64 {
        let s2 = self.sigma * self.sigma / r2;
        let s6 = s2 * s2 * s2;
        4.0 * self.epsilon * (s6 * s6 - s6)
    }

    /// Magnitude of `dE/dr` divided by `r`, so the force on atom `i`
    /// from atom `j` is `(dE/dr / r) * (r_i - r_j)`.
    fn pair_force_over_r(&self, r2: f64) -> f64 {
        let s2 = self.sigma * self.sigma / r2;
        let s6 = s2 * s2 * s2;
        24.0 * self.epsilon * (2.0 * s6 * s6 - s6) / r2
    }

    /// Iterate interacting pairs `(i, j, displacement, r²)`.
    fn pairs<'a>(
        &'a self,
        structure: &'a Structure,
    ) -> impl Iterator<Item = (usize, usize, [f64; 3], f64)> + 'a {
        let cutoff2 = self.cutoff * self.cutoff;
        let positions = &structure.positions;
        (0..positions.len()).flat_map(move |i| {
            (i + 1..positions.len()).filter_map(move |j| {
                let d = [
                    positions[i][0] - positions[j][0],
                    positions[i][1] - positions[j][1],
                    positions[i][2] - positions[j][2],
                ];
                let r2 = d[0] * d[0] + d[1] * d[1] + d[2] * d[2];
                if r2 == 0.0 {
                    return None; // coincident atoms contribute nothing finite
                }
                (r2 <= cutoff2).then_some((i, j, d, r2))
            })
        })
    }

    fn cell_volume(structure: &Structure) -> f64 {
        let c = &structure.cell;
        let det = c[0][0] * (c[1][1] * c[2][2] - c[1][2] * c[2][1])
            - c[0][1] * (c[1][0] * c[2][2] - c[1][2] * c[2][0])
            + c[0][2] * (c[1][0] * c[2][1] - c[1][1] * c[2][0]);
        det.abs()
    }
}

impl Calculator for LennardJones {
    fn potential_energy(&self, structure: &Structure) -> Result<f64, CalculatorError> {
        Ok(self.pairs(structure).map(|(_, _, _, r2)| self.pair_energy(r2)).sum())
    }

    fn forces(&self, structure: &Structure) -> Result<Vec<[f64; 3]>, CalculatorError> {
        let mut forces = vec![[0.0; 3]; structure.len()];
        for (i, j, d, r2) in self.pairs(structure) {
            let f_over_r = self.pair_force_over_r(r2);
            for a in 0..3 {
                forces[i][a] += f_over_r * d[a];
                forces[j][a] -= f_over_r * d[a];
            }
        }
        Ok(forces)
    }

    fn stress(&self, structure: &Structure) -> Result<[f64; 6], CalculatorError> {
        let volume = Self::cell_volume(structure);
        if volume <= f64::EPSILON {
            return Err(CalculatorError::Failed(
                "cell volume is zero; stress is undefined for a non-periodic structure"
                    .to_string(),
            ));
        }

        // Virial: σ_ab = -(1/V) Σ_pairs d_a f_b with f the force on atom i
        // from atom j along d = r_i - r_j.
        let mut tensor = [[0.0; 3]; 3];
        for (_, _, d, r2) in self.pairs(structure) {
            let f_over_r = self.pair_force_over_r(r2);
            for a in 0..3 {
                for b in 0..3 {
                    tensor[a][b] -= d[a] * (f_over_r * d[b]);
                }
            }
        }
        for row in tensor.iter_mut() {
            for v in row.iter_mut() {
                *v /= volume;
            }
        }

        // Voigt order: xx, yy, zz, yz, xz, xy.
        Ok([
            tensor[0][0],
            tensor[1][1],
            tensor[2][2],
            tensor[1][2],
            tensor[0][2],
            tensor[0][1],
        ])
    }
}

/// Fixed-result calculator for pipeline tests and demos.
///
/// Returns the configured energy, zero forces, and zero stress after an
/// optional simulated delay.
#[derive(Debug, Clone)]
pub struct Constant {
    /// Energy returned for every structure.
    pub energy: f64,
    /// Simulated evaluation delay.
    pub delay: Duration,
}

impl Default for Constant {
    fn default() -> Self {
        Self {
            energy: 0.0,
            delay: Duration::from_millis(0),
        }
    }
}

impl Constant {
    /// Create a calculator that always reports `energy`.
    pub fn with_energy(energy: f64) -> Self {
        Self {
            energy,
            ..Self::default()
        }
    }

    /// Set a simulated per-call delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn simulate_work(&self) {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
    }
}

impl Calculator for Constant {
    fn potential_energy(&self, _structure: &Structure) -> Result<f64, CalculatorError> {
        self.simulate_work();
        Ok(self.energy)
    }

    fn forces(&self, structure: &Structure) -> Result<Vec<[f64; 3]>, CalculatorError> {
        self.simulate_work();
        Ok(vec![[0.0; 3]; structure.len()])
    }

    fn stress(&self, _structure: &Structure) -> Result<[f64; 6], CalculatorError> {
        self.simulate_work();
        Ok([0.0; 6])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dimer(r: f64) -> Structure {
        Structure {
            numbers: vec![18, 18],
            positions: vec![[0.0, 0.0, 0.0], [r, 0.0, 0.0]],
            cell: [[0.0; 3]; 3],
            pbc: [false; 3],
        }
    }

    #[test]
    fn test_lj_dimer_energy_at_minimum() {
        // The 12-6 minimum sits at r = 2^(1/6) σ with E = -ε.
        let lj = LennardJones::default();
        let r0 = 2f64.powf(1.0 / 6.0);
        let energy = lj.potential_energy(&dimer(r0)).ok().unwrap();
        assert!((energy + 1.0).abs() < 1e-12, "energy at minimum was {energy}");
    }

    #[test]
    fn test_lj_dimer_energy_zero_at_sigma() {
        let lj = LennardJones::default();
        let energy = lj.potential_energy(&dimer(1.0)).ok().unwrap();
        assert!(energy.abs() < 1e-12);
    }

    #[test]
    fn test_lj_forces_vanish_at_minimum() {
        let lj = LennardJones::default();
        let r0 = 2f64.powf(1.0 / 6.0);
        let forces = lj.forces(&dimer(r0)).ok().unwrap();
        for f in forces.iter().flatten() {
            assert!(f.abs() < 1e-10, "nonzero force {f} at the minimum");
        }
    }

    #[test]
    fn test_lj_forces_are_antisymmetric_and_repulsive_close_in() {
        let lj = LennardJones::default();
        let forces = lj.forces(&dimer(0.9)).ok().unwrap();
        assert!((forces[0][0] + forces[1][0]).abs() < 1e-12);
        // Atom 0 sits at the origin with the partner at +x; repulsion
        // pushes it toward -x.
        assert!(forces[0][0] < 0.0);
        assert!(forces[1][0] > 0.0);
    }

    #[test]
    fn test_lj_pairs_beyond_cutoff_do_not_interact() {
        let lj = LennardJones::default();
        let energy = lj.potential_energy(&dimer(3.5)).ok().unwrap();
        assert_eq!(energy, 0.0);
    }

    #[test]
    fn test_lj_stress_requires_a_cell() {
        let lj = LennardJones::default();
        let result = lj.stress(&dimer(1.0));
        assert!(matches!(result, Err(CalculatorError::Failed(_))));
    }

    #[test]
    fn test_lj_stress_with_cell_is_finite() {
        let lj = LennardJones::default();
        let mut structure = dimer(1.1);
        structure.cell = [[10.0, 0.0, 0.0], [0.0, 10.0, 0.0], [0.0, 0.0, 10.0]];
        let stress = lj.stress(&structure).ok().unwrap();
        assert!(stress.iter().all(|s| s.is_finite()));
        // Off-axis components vanish for a dimer on the x axis.
        assert!(stress[3].abs() < 1e-15 && stress[4].abs() < 1e-15 && stress[5].abs() < 1e-15);
        assert!(stress[0].abs() > 0.0);
    }

    #[test]
    fn test_constant_returns_configured_energy() {
        let calc = Constant::with_energy(-4.25);
        let energy = calc.potential_energy(&dimer(1.0)).ok().unwrap();
        assert_eq!(energy, -4.25);
        assert_eq!(calc.forces(&dimer(1.0)).ok().unwrap().len(), 2);
        assert_eq!(calc.stress(&dimer(1.0)).ok().unwrap(), [0.0; 6]);
    }

    #[test]
    fn test_registry_create_known_model() {
        let registry = CalculatorRegistry::with_builtins();
        assert!(registry.create("lj").is_ok());
        assert!(registry.create("constant").is_ok());
    }

    #[test]
    fn test_registry_unknown_model_lists_known_names() {
        let registry = CalculatorRegistry::with_builtins();
        let err = match registry.create("mace-mpa-0") {
            Err(e) => e,
            Ok(_) => return assert!(false, "expected load error"),
        };
        let msg = err.to_string();
        assert!(msg.contains("mace-mpa-0"));
        assert!(msg.contains("lj"));
    }

    #[test]
    fn test_registry_register_custom_factory() {
        let mut registry = CalculatorRegistry::new();
        registry.register("fixed", || Ok(Arc::new(Constant::with_energy(7.0))));
        let calc = registry.create("fixed").ok().unwrap();
        assert_eq!(calc.potential_energy(&dimer(1.0)).ok().unwrap(), 7.0);
        assert_eq!(registry.names(), vec!["fixed".to_string()]);
    }

    #[test]
    fn test_registry_factory_failure_propagates() {
        let mut registry = CalculatorRegistry::new();
        registry.register("broken", || {
            Err(CalculatorError::Load("weights file missing".to_string()))
        });
        let result = registry.create("broken");
        assert!(matches!(result, Err(CalculatorError::Load(msg)) if msg.contains("weights")));
    }
}
