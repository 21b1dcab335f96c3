//! Composite model construction.

use serde::{Deserialize, Serialize};

use crate::component::ComponentSpec;
use crate::template::Template;
use crate::FactoryError;

/// Axis sub-range `[a, b]` whose content defines a component's yield.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizationWindow {
    pub a: f64,
    pub b: f64,
}

impl NormalizationWindow {
    pub fn new(a: f64, b: f64) -> Self {
        Self { a, b }
    }
}

/// `target_yield / integral`, the integral taken over the window if one is set.
pub fn normalization_factor(
    template: &Template,
    target_yield: f64,
    window: Option<NormalizationWindow>,
) -> Result<f64, FactoryError> {
    let denominator = match window {
        Some(w) => template.integral_range(w.a, w.b),
        None => template.integral(),
    };
    if denominator == 0.0 || !denominator.is_finite() {
        return Err(FactoryError::Numeric(format!(
            "cannot normalize to {target_yield}: template integral is {denominator}"
        )));
    }
    Ok(target_yield / denominator)
}

/// Normalize a copy of the component's template and add it to `model`.
pub fn add_component(model: &mut Template, component: &ComponentSpec) -> Result<(), FactoryError> {
    let factor =
        normalization_factor(&component.template, component.target_yield, component.window)
            .map_err(|err| match err {
                FactoryError::Numeric(msg) => {
                    FactoryError::Numeric(format!("component '{}': {msg}", component.name))
                }
                other => other,
            })?;
    let mut scaled = component.template.clone();
    scaled.scale(factor);
    model.add(&scaled, 1.0)
}

/// Weighted sum of all component templates.
pub fn build_model(components: &[ComponentSpec]) -> Result<Template, FactoryError> {
    let first = components
        .first()
        .ok_or_else(|| FactoryError::Config("no components configured".to_string()))?;
    let mut model = Template::zeros(*first.template.binning());
    for component in components {
        add_component(&mut model, component)?;
    }
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::{build_model, normalization_factor, NormalizationWindow};
    use crate::component::ComponentSpec;
    use crate::template::{Binning, Template};
    use crate::FactoryError;
    use approx::assert_relative_eq;

    fn binning() -> Binning {
        Binning::new(10, 0.0, 10.0).unwrap()
    }

    fn flat(value: f64) -> Template {
        Template::from_contents(binning(), vec![value; 10]).unwrap()
    }

    #[test]
    fn flat_components_sum_to_flat_model() {
        let sig = ComponentSpec::new("sig", flat(1.0), 10.0);
        let bkg = ComponentSpec::new("bkg", flat(1.0), 90.0);
        assert_eq!(normalization_factor(&sig.template, 10.0, None).unwrap(), 1.0);
        assert_eq!(normalization_factor(&bkg.template, 90.0, None).unwrap(), 9.0);

        let model = build_model(&[sig, bkg]).unwrap();
        for c in model.contents() {
            assert_relative_eq!(*c, 10.0, max_relative = 1e-12);
        }
        assert_relative_eq!(model.integral(), 100.0, max_relative = 1e-12);
    }

    #[test]
    fn windowed_yield_is_exact_inside_window() {
        let contents = (1..=10).map(f64::from).collect::<Vec<_>>();
        let template = Template::from_contents(binning(), contents).unwrap();
        let window = NormalizationWindow::new(2.0, 4.5);
        let component = ComponentSpec::new("c", template, 30.0).with_window(window);

        let model = build_model(&[component]).unwrap();
        assert_relative_eq!(model.integral_range(2.0, 4.5), 30.0, max_relative = 1e-12);
        // bins 2..=4 hold 12 of 55 in the source
        assert_relative_eq!(model.integral(), 30.0 * 55.0 / 12.0, max_relative = 1e-12);
    }

    #[test]
    fn arbitrary_yield_is_reached_without_window() {
        let contents = vec![0.3, 1.7, 0.0, 4.2, 9.9, 0.01, 2.0, 3.3, 0.5, 7.0];
        let template = Template::from_contents(binning(), contents).unwrap();
        let model = build_model(&[ComponentSpec::new("c", template, 1234.5)]).unwrap();
        assert_relative_eq!(model.integral(), 1234.5, max_relative = 1e-6);
    }

    #[test]
    fn zero_integral_is_numeric_error() {
        let component = ComponentSpec::new("empty", flat(0.0), 5.0);
        assert!(matches!(build_model(&[component]), Err(FactoryError::Numeric(_))));
    }

    #[test]
    fn empty_component_list_is_rejected() {
        assert!(matches!(build_model(&[]), Err(FactoryError::Config(_))));
    }
}
