//! Randomized shape distortions.
//!
//! Distortions run once per iteration on the iteration's own copy of the
//! component list, in two ordered passes: global rules first, then
//! specific rules, each pass in declaration order.
//!
//! * A global rule picks one candidate directory under the distortion
//!   prefix and distorts every store-sourced component in its scope with
//!   the template found at the component's own store path under that
//!   directory. File-sourced components are never globally distorted.
//! * A specific rule targets a single component and reads the distortion
//!   template at `prefix/candidate`, object name taken from the rule
//!   override or from the component.
//!
//! Discrete rules draw `gen_range(0..=K)`; index `K` leaves the
//! components untouched. Interpolated rules draw `gen_range(0..K)` and
//! then one weight `w` in `[0, 1)`, and replace each target with
//! `w * renorm(T * D) + (1 - w) * T` where `renorm` restores the integral
//! of `T`. A missing distortion template is a warning, not an error.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::component::{join_store_path, resolve_mixture, ComponentSource, ComponentSpec};
use crate::config::FactoryConfig;
use crate::store::TemplateStore;
use crate::template::Template;
use crate::FactoryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistortionMode {
    #[default]
    Discrete,
    Interpolated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistortionChoice {
    Template(String),
    Identity,
}

impl DistortionChoice {
    fn from_candidate(candidate: &Option<String>) -> Self {
        match candidate {
            Some(path) => DistortionChoice::Template(path.clone()),
            None => DistortionChoice::Identity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Empty `components` selects every store-sourced component.
    Group {
        label: String,
        components: Vec<String>,
    },
    Single(String),
}

impl Scope {
    pub fn label(&self) -> &str {
        match self {
            Scope::Group { label, .. } => label,
            Scope::Single(name) => name,
        }
    }

    fn includes(&self, component: &ComponentSpec) -> bool {
        match self {
            Scope::Group { components, .. } => {
                components.is_empty() || components.iter().any(|n| *n == component.name)
            }
            Scope::Single(name) => *name == component.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DistortionRule {
    pub scope: Scope,
    pub mode: DistortionMode,
    pub candidates: Vec<DistortionChoice>,
    pub template_override: Option<String>,
}

/// What one rule did during one iteration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedDistortion {
    pub rule: String,
    pub index: usize,
    pub choice: DistortionChoice,
    pub weight: Option<f64>,
    pub distorted: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DistortionReport {
    pub applied: Vec<AppliedDistortion>,
    pub warnings: Vec<String>,
    /// False when no rule reached any component in this iteration.
    pub matched_any: bool,
}

impl DistortionReport {
    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }
}

/// Draw a candidate index. Discrete draws include `k`, the identity slot.
pub fn draw_choice<R: Rng + ?Sized>(rng: &mut R, mode: DistortionMode, k: usize) -> usize {
    match mode {
        DistortionMode::Discrete => rng.gen_range(0..=k),
        DistortionMode::Interpolated => rng.gen_range(0..k),
    }
}

pub fn draw_weight<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    rng.gen::<f64>()
}

/// Elementwise multiplication by the distortion template.
pub fn apply_discrete(template: &mut Template, distortion: &Template) -> Result<(), FactoryError> {
    template.multiply(distortion)
}

/// Blend the template with its distorted, integral-preserving version.
pub fn apply_interpolated(
    template: &mut Template,
    distortion: &Template,
    weight: f64,
) -> Result<(), FactoryError> {
    let original = template.integral();
    let mut distorted = template.clone();
    distorted.multiply(distortion)?;
    distorted.normalize_to(original)?;
    template.scale(1.0 - weight);
    template.add(&distorted, weight)
}

#[derive(Debug, Clone, Default)]
pub struct DistortionEngine {
    prefix: String,
    global: Vec<DistortionRule>,
    specific: Vec<DistortionRule>,
}

impl DistortionEngine {
    pub fn new(
        prefix: &str,
        global: Vec<DistortionRule>,
        specific: Vec<DistortionRule>,
    ) -> Result<Self, FactoryError> {
        for rule in global.iter().chain(&specific) {
            if rule.candidates.is_empty() {
                return Err(FactoryError::Config(format!(
                    "distortion '{}' has no candidates",
                    rule.scope.label()
                )));
            }
            if rule.mode == DistortionMode::Interpolated
                && rule.candidates.contains(&DistortionChoice::Identity)
            {
                return Err(FactoryError::Config(format!(
                    "interpolated distortion '{}' cannot have an identity candidate",
                    rule.scope.label()
                )));
            }
        }
        if let Some(rule) = global
            .iter()
            .find(|r| matches!(r.scope, Scope::Single(_)))
        {
            return Err(FactoryError::Config(format!(
                "global distortion '{}' must have a group scope",
                rule.scope.label()
            )));
        }
        if let Some(rule) = specific
            .iter()
            .find(|r| matches!(r.scope, Scope::Group { .. }))
        {
            return Err(FactoryError::Config(format!(
                "specific distortion '{}' must target a single component",
                rule.scope.label()
            )));
        }
        Ok(Self {
            prefix: prefix.to_string(),
            global,
            specific,
        })
    }

    pub fn from_config(config: &FactoryConfig) -> Result<Self, FactoryError> {
        let global = config
            .distortions
            .global
            .iter()
            .map(|rule| DistortionRule {
                scope: Scope::Group {
                    label: rule.label.clone(),
                    components: rule.components.clone(),
                },
                mode: rule.mode,
                candidates: rule.candidates.iter().map(DistortionChoice::from_candidate).collect(),
                template_override: rule.hist_name.clone(),
            })
            .collect();
        let specific = config
            .distortions
            .specific
            .iter()
            .map(|rule| DistortionRule {
                scope: Scope::Single(rule.component.clone()),
                mode: rule.mode,
                candidates: rule.candidates.iter().map(DistortionChoice::from_candidate).collect(),
                template_override: rule.hist_name.clone(),
            })
            .collect();
        Self::new(&config.distortions.prefix, global, specific)
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty() && self.specific.is_empty()
    }

    /// Run the global pass, then the specific pass, mutating `components`.
    pub fn apply<S, R>(
        &self,
        components: &mut [ComponentSpec],
        store: &mut S,
        rng: &mut R,
    ) -> Result<DistortionReport, FactoryError>
    where
        S: TemplateStore + ?Sized,
        R: Rng + ?Sized,
    {
        let mut report = DistortionReport::default();

        if !self.global.is_empty() {
            debug!("applying global distortions");
        }
        for rule in &self.global {
            self.apply_global(rule, components, store, rng, &mut report)?;
        }

        if !self.specific.is_empty() {
            debug!("applying specific distortions");
        }
        for rule in &self.specific {
            self.apply_specific(rule, components, store, rng, &mut report)?;
        }

        if !report.matched_any {
            report.warn("nothing was distorted in this iteration".to_string());
        }
        Ok(report)
    }

    fn apply_global<S, R>(
        &self,
        rule: &DistortionRule,
        components: &mut [ComponentSpec],
        store: &mut S,
        rng: &mut R,
        report: &mut DistortionReport,
    ) -> Result<(), FactoryError>
    where
        S: TemplateStore + ?Sized,
        R: Rng + ?Sized,
    {
        let label = rule.scope.label();
        let (index, weight) = draw(rule, rng);
        let Some(candidate) = chosen_path(rule, index) else {
            debug!(rule = label, "chosen random distortion: stay with current shape");
            report.matched_any = true;
            report.applied.push(identity_record(label, index, weight));
            return Ok(());
        };
        debug!(rule = label, candidate, ?weight, "chosen random distortion");

        let root = join_store_path(&self.prefix, candidate);
        let mut distorted = Vec::new();
        for component in components.iter_mut() {
            if !rule.scope.includes(component) {
                continue;
            }
            let parts = match &component.source {
                ComponentSource::Store { parts } => parts.clone(),
                ComponentSource::File { .. } => {
                    debug!(component = %component.name, "skipping file-sourced component");
                    continue;
                }
            };
            let object = rule
                .template_override
                .clone()
                .unwrap_or_else(|| component.object.clone());

            let distortion = match resolve_mixture(store, &root, &parts, &object) {
                Ok(template) => template,
                Err(FactoryError::Store(err)) if err.is_not_found() => {
                    report.warn(format!(
                        "could not find distortion for component '{}' in '{root}': {err}",
                        component.name
                    ));
                    continue;
                }
                Err(err) => return Err(err),
            };

            distort(&mut component.template, &distortion, weight)?;
            debug!(component = %component.name, "distorted");
            distorted.push(component.name.clone());
        }

        if distorted.is_empty() {
            report.warn(format!(
                "global distortion '{label}' did not match any component"
            ));
        } else {
            report.matched_any = true;
        }
        report.applied.push(AppliedDistortion {
            rule: label.to_string(),
            index,
            choice: DistortionChoice::Template(candidate.to_string()),
            weight,
            distorted,
        });
        Ok(())
    }

    fn apply_specific<S, R>(
        &self,
        rule: &DistortionRule,
        components: &mut [ComponentSpec],
        store: &mut S,
        rng: &mut R,
        report: &mut DistortionReport,
    ) -> Result<(), FactoryError>
    where
        S: TemplateStore + ?Sized,
        R: Rng + ?Sized,
    {
        let label = rule.scope.label();
        let Some(component) = components.iter_mut().find(|c| rule.scope.includes(c)) else {
            report.warn(format!("could not find component '{label}' to distort"));
            return Ok(());
        };

        let (index, weight) = draw(rule, rng);
        report.matched_any = true;
        let Some(candidate) = chosen_path(rule, index) else {
            debug!(rule = label, "chosen random distortion: stay with current shape");
            report.applied.push(identity_record(label, index, weight));
            return Ok(());
        };
        debug!(rule = label, candidate, ?weight, "chosen random distortion");

        let path = join_store_path(&self.prefix, candidate);
        let object = rule
            .template_override
            .as_deref()
            .unwrap_or(&component.object);
        let mut distorted = Vec::new();
        match store.get(&path, object) {
            Ok(distortion) => {
                distort(&mut component.template, &distortion, weight)?;
                distorted.push(component.name.clone());
            }
            Err(err) if err.is_not_found() => {
                report.warn(format!(
                    "could not load distortion for component '{label}': {err}"
                ));
            }
            Err(err) => return Err(err.into()),
        }

        report.applied.push(AppliedDistortion {
            rule: label.to_string(),
            index,
            choice: DistortionChoice::Template(candidate.to_string()),
            weight,
            distorted,
        });
        Ok(())
    }
}

/// Index draw followed, for interpolated rules, by the weight draw.
fn draw<R: Rng + ?Sized>(rule: &DistortionRule, rng: &mut R) -> (usize, Option<f64>) {
    let index = draw_choice(rng, rule.mode, rule.candidates.len());
    let weight = match rule.mode {
        DistortionMode::Discrete => None,
        DistortionMode::Interpolated => Some(draw_weight(rng)),
    };
    (index, weight)
}

fn chosen_path(rule: &DistortionRule, index: usize) -> Option<&str> {
    match rule.candidates.get(index) {
        Some(DistortionChoice::Template(path)) => Some(path),
        Some(DistortionChoice::Identity) | None => None,
    }
}

fn identity_record(rule: &str, index: usize, weight: Option<f64>) -> AppliedDistortion {
    AppliedDistortion {
        rule: rule.to_string(),
        index,
        choice: DistortionChoice::Identity,
        weight,
        distorted: Vec::new(),
    }
}

fn distort(
    template: &mut Template,
    distortion: &Template,
    weight: Option<f64>,
) -> Result<(), FactoryError> {
    match weight {
        Some(w) => apply_interpolated(template, distortion, w),
        None => apply_discrete(template, distortion),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        apply_interpolated, draw_choice, DistortionChoice, DistortionEngine, DistortionMode,
        DistortionRule, Scope,
    };
    use crate::component::{ComponentSource, ComponentSpec};
    use crate::store::MemoryStore;
    use crate::template::{Binning, Template};
    use crate::FactoryError;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn binning() -> Binning {
        Binning::new(4, 0.0, 4.0).unwrap()
    }

    fn template(values: [f64; 4]) -> Template {
        Template::from_contents(binning(), values.to_vec()).unwrap()
    }

    fn store_component(name: &str, values: [f64; 4]) -> ComponentSpec {
        ComponentSpec::new(name, template(values), 10.0).with_source(
            ComponentSource::Store {
                parts: vec![(format!("{name}/pdf"), 1.0)],
            },
            "h",
        )
    }

    fn rule(scope: Scope, mode: DistortionMode, candidates: &[&str]) -> DistortionRule {
        DistortionRule {
            scope,
            mode,
            candidates: candidates
                .iter()
                .map(|c| DistortionChoice::Template(c.to_string()))
                .collect(),
            template_override: None,
        }
    }

    /// First seed whose first `draw_choice` lands on `wanted`.
    fn seed_for_choice(mode: DistortionMode, k: usize, wanted: usize) -> u64 {
        (0..10_000)
            .find(|seed| {
                let mut trial = ChaCha8Rng::seed_from_u64(*seed);
                draw_choice(&mut trial, mode, k) == wanted
            })
            .unwrap()
    }

    #[test]
    fn interpolation_preserves_integral_and_hits_endpoints() {
        let original = template([1.0, 2.0, 3.0, 4.0]);
        let distortion = template([2.0, 1.0, 0.5, 0.0]);

        let mut full = original.clone();
        full.multiply(&distortion).unwrap();
        full.normalize_to(original.integral()).unwrap();

        let mut at_one = original.clone();
        apply_interpolated(&mut at_one, &distortion, 1.0).unwrap();
        for (a, b) in at_one.contents().iter().zip(full.contents()) {
            assert_relative_eq!(*a, *b, max_relative = 1e-12);
        }

        let mut at_zero = original.clone();
        apply_interpolated(&mut at_zero, &distortion, 0.0).unwrap();
        assert_eq!(at_zero.contents(), original.contents());

        for w in [0.1, 0.37, 0.5, 0.93] {
            let mut blended = original.clone();
            apply_interpolated(&mut blended, &distortion, w).unwrap();
            assert_relative_eq!(blended.integral(), original.integral(), max_relative = 1e-12);
        }
    }

    #[test]
    fn discrete_identity_leaves_bins_unchanged() {
        let seed = seed_for_choice(DistortionMode::Discrete, 2, 2);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut store = MemoryStore::new(binning());
        let base = vec![store_component("a", [1.0, 2.0, 3.0, 4.0])];
        let mut components = base.clone();
        let engine = DistortionEngine::new(
            "dist",
            Vec::new(),
            vec![rule(Scope::Single("a".to_string()), DistortionMode::Discrete, &["x", "y"])],
        )
        .unwrap();

        let report = engine.apply(&mut components, &mut store, &mut rng).unwrap();
        assert_eq!(components, base);
        assert_eq!(report.applied[0].choice, DistortionChoice::Identity);
        assert!(report.matched_any);
        assert_eq!(store.lookups(), 0);
    }

    #[test]
    fn global_rule_distorts_matching_components_only() {
        let seed = seed_for_choice(DistortionMode::Discrete, 1, 0);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut store = MemoryStore::new(binning());
        store.insert_template("dist/tl/a/pdf", "h", template([2.0, 2.0, 2.0, 2.0]));

        let file_sourced = ComponentSpec::new("user", template([1.0; 4]), 1.0).with_source(
            ComponentSource::File {
                path: "user.json".to_string(),
            },
            "h",
        );
        let mut components = vec![
            store_component("a", [1.0, 2.0, 3.0, 4.0]),
            store_component("b", [1.0, 1.0, 1.0, 1.0]),
            file_sourced,
        ];
        let engine = DistortionEngine::new(
            "dist",
            vec![rule(
                Scope::Group {
                    label: "tl".to_string(),
                    components: Vec::new(),
                },
                DistortionMode::Discrete,
                &["tl"],
            )],
            Vec::new(),
        )
        .unwrap();

        let report = engine.apply(&mut components, &mut store, &mut rng).unwrap();
        assert_eq!(components[0].template.contents(), &[2.0, 4.0, 6.0, 8.0]);
        assert_eq!(components[1].template.contents(), &[1.0; 4]);
        assert_eq!(components[2].template.contents(), &[1.0; 4]);
        assert_eq!(report.applied[0].distorted, vec!["a".to_string()]);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.matched_any);
    }

    #[test]
    fn missing_distortion_template_is_a_warning() {
        let seed = seed_for_choice(DistortionMode::Interpolated, 1, 0);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut store = MemoryStore::new(binning());
        let base = vec![store_component("a", [1.0, 2.0, 3.0, 4.0])];
        let mut components = base.clone();
        let engine = DistortionEngine::new(
            "dist",
            Vec::new(),
            vec![rule(
                Scope::Single("a".to_string()),
                DistortionMode::Interpolated,
                &["missing"],
            )],
        )
        .unwrap();

        let report = engine.apply(&mut components, &mut store, &mut rng).unwrap();
        assert_eq!(components, base);
        assert!(report.applied[0].weight.is_some());
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn empty_engine_reports_nothing_distorted() {
        let engine = DistortionEngine::default();
        let mut store = MemoryStore::new(binning());
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut components = vec![store_component("a", [1.0; 4])];
        let report = engine.apply(&mut components, &mut store, &mut rng).unwrap();
        assert!(!report.matched_any);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn rejects_rules_without_candidates_or_with_wrong_scope() {
        let empty = rule(Scope::Single("a".to_string()), DistortionMode::Discrete, &[]);
        assert!(DistortionEngine::new("d", Vec::new(), vec![empty]).is_err());

        let single = rule(Scope::Single("a".to_string()), DistortionMode::Discrete, &["x"]);
        assert!(DistortionEngine::new("d", vec![single], Vec::new()).is_err());
    }

    #[test]
    fn rejects_identity_candidate_on_interpolated_rule() {
        let mut specific = rule(Scope::Single("a".to_string()), DistortionMode::Interpolated, &["x"]);
        specific.candidates.push(DistortionChoice::Identity);
        assert!(matches!(
            DistortionEngine::new("d", Vec::new(), vec![specific.clone()]),
            Err(FactoryError::Config(_))
        ));

        specific.mode = DistortionMode::Discrete;
        let engine = DistortionEngine::new("d", Vec::new(), vec![specific]).unwrap();
        assert!(!engine.is_empty());
    }

    #[test]
    fn global_rule_resolves_weighted_mixture_under_candidate() {
        let seed = seed_for_choice(DistortionMode::Interpolated, 1, 0);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut store = MemoryStore::new(binning());
        store.insert_template("dist/tl/cables/th", "h", template([1.0, 1.0, 1.0, 1.0]));
        store.insert_template("dist/tl/holders/th", "h", template([0.0, 0.0, 0.0, 4.0]));

        let original = template([1.0, 1.0, 1.0, 1.0]);
        let mut components = vec![ComponentSpec::new("th", original.clone(), 50.0).with_source(
            ComponentSource::Store {
                parts: vec![("cables/th".to_string(), 0.25), ("holders/th".to_string(), 0.75)],
            },
            "h",
        )];
        let engine = DistortionEngine::new(
            "dist",
            vec![rule(
                Scope::Group {
                    label: "tl".to_string(),
                    components: vec!["th".to_string()],
                },
                DistortionMode::Interpolated,
                &["tl"],
            )],
            Vec::new(),
        )
        .unwrap();

        let report = engine.apply(&mut components, &mut store, &mut rng).unwrap();
        let w = report.applied[0].weight.unwrap();

        // 0.25 * cables + 0.75 * holders, already at the integral of the flat template
        let renorm = [0.25, 0.25, 0.25, 3.25];
        for (bin, value) in components[0].template.contents().iter().enumerate() {
            assert_relative_eq!(*value, w * renorm[bin] + (1.0 - w), max_relative = 1e-12);
        }
        assert_relative_eq!(components[0].template.integral(), original.integral(), max_relative = 1e-12);
        assert_eq!(report.applied[0].distorted, vec!["th".to_string()]);
        assert_eq!(store.lookups(), 2);
    }
}
