use rand::Rng;
use rand_distr::{Distribution, Poisson};
use serde::Serialize;

use crate::component::ComponentSpec;
use crate::model::build_model;
use crate::template::{Binning, Template};
use crate::FactoryError;

/// One Poisson-fluctuated dataset drawn from the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PseudoExperiment {
    pub index: usize,
    pub name: String,
    pub binning: Binning,
    pub counts: Vec<u64>,
}

impl PseudoExperiment {
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

/// One Poisson draw. A mean of exactly zero returns 0 without consuming
/// randomness.
pub fn poisson_draw<R: Rng + ?Sized>(rng: &mut R, mean: f64) -> Result<u64, FactoryError> {
    if mean == 0.0 {
        return Ok(0);
    }
    if !mean.is_finite() || mean < 0.0 {
        return Err(FactoryError::Numeric(format!(
            "poisson mean must be finite and >= 0, got {mean}"
        )));
    }
    let poisson = Poisson::new(mean)
        .map_err(|err| FactoryError::Numeric(format!("poisson mean {mean}: {err}")))?;
    Ok(poisson.sample(rng) as u64)
}

/// Draw every bin of `model` independently.
pub fn generate_experiment<R: Rng + ?Sized>(
    model: &Template,
    rng: &mut R,
    index: usize,
    name: &str,
) -> Result<PseudoExperiment, FactoryError> {
    let counts = model
        .contents()
        .iter()
        .map(|&mean| poisson_draw(&mut *rng, mean))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(PseudoExperiment {
        index,
        name: format!("{name}_{index}"),
        binning: *model.binning(),
        counts,
    })
}

/// Rebuild the model from the given components and draw one experiment.
pub fn generate_from_components<R: Rng + ?Sized>(
    components: &[ComponentSpec],
    rng: &mut R,
    index: usize,
    name: &str,
) -> Result<(Template, PseudoExperiment), FactoryError> {
    let model = build_model(components)?;
    let experiment = generate_experiment(&model, rng, index, name)?;
    Ok((model, experiment))
}

/// Binning after merging every `factor` adjacent bins.
pub fn rebinned(binning: &Binning, factor: usize) -> Result<Binning, FactoryError> {
    let n_bins = binning.n_bins();
    if factor == 0 || n_bins % factor != 0 {
        return Err(FactoryError::Numeric(format!(
            "rebin factor {factor} does not divide {n_bins} bins"
        )));
    }
    Binning::new(n_bins / factor, binning.xmin(), binning.xmax())
}

/// Merge every `factor` adjacent bins by summation.
pub fn rebin_counts(
    experiment: &PseudoExperiment,
    factor: usize,
) -> Result<PseudoExperiment, FactoryError> {
    let binning = rebinned(&experiment.binning, factor)?;
    let counts: Vec<u64> = experiment
        .counts
        .chunks(factor)
        .map(|chunk| chunk.iter().sum())
        .collect();
    Ok(PseudoExperiment {
        index: experiment.index,
        name: experiment.name.clone(),
        binning,
        counts,
    })
}

#[cfg(test)]
mod tests {
    use super::{generate_experiment, poisson_draw, rebin_counts, PseudoExperiment};
    use crate::template::{Binning, Template};
    use crate::FactoryError;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn zero_mean_draws_zero_without_touching_rng() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut untouched = rng.clone();
        assert_eq!(poisson_draw(&mut rng, 0.0).unwrap(), 0);
        assert_eq!(rng.gen::<u64>(), untouched.gen::<u64>());
    }

    #[test]
    fn negative_mean_is_numeric_error() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        assert!(matches!(poisson_draw(&mut rng, -1.0), Err(FactoryError::Numeric(_))));
        assert!(matches!(poisson_draw(&mut rng, f64::NAN), Err(FactoryError::Numeric(_))));
    }

    #[test]
    fn empty_bins_stay_empty_for_any_seed() {
        let binning = Binning::new(6, 0.0, 6.0).unwrap();
        let model =
            Template::from_contents(binning, vec![0.0, 50.0, 0.0, 3.0, 0.0, 1000.0]).unwrap();
        for seed in 0..64 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let exp = generate_experiment(&model, &mut rng, 0, "h").unwrap();
            assert_eq!(exp.counts[0], 0);
            assert_eq!(exp.counts[2], 0);
            assert_eq!(exp.counts[4], 0);
        }
    }

    #[test]
    fn sample_mean_tracks_model() {
        let binning = Binning::new(1, 0.0, 1.0).unwrap();
        let model = Template::from_contents(binning, vec![25.0]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(2026);
        let n = 4000;
        let sum: u64 = (0..n)
            .map(|i| generate_experiment(&model, &mut rng, i, "h").unwrap().total())
            .sum();
        let mean = sum as f64 / n as f64;
        assert!((mean - 25.0).abs() < 0.5, "sample mean {mean}");
    }

    #[test]
    fn rebin_preserves_counts_and_rejects_bad_factor() {
        let exp = PseudoExperiment {
            index: 3,
            name: "h_3".to_string(),
            binning: Binning::new(6, 0.0, 6.0).unwrap(),
            counts: vec![1, 2, 3, 4, 5, 6],
        };
        let merged = rebin_counts(&exp, 3).unwrap();
        assert_eq!(merged.counts, vec![6, 15]);
        assert_eq!(merged.total(), exp.total());
        assert_eq!(merged.binning.n_bins(), 2);

        assert!(matches!(rebin_counts(&exp, 4), Err(FactoryError::Numeric(_))));
        assert!(matches!(rebin_counts(&exp, 0), Err(FactoryError::Numeric(_))));
    }

    #[test]
    fn experiments_are_named_by_index() {
        let binning = Binning::new(2, 0.0, 2.0).unwrap();
        let model = Template::from_contents(binning, vec![1.0, 1.0]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let exp = generate_experiment(&model, &mut rng, 12, "toy").unwrap();
        assert_eq!(exp.name, "toy_12");
        assert_eq!(exp.binning, binning);
    }
}
