use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::distortion::DistortionMode;
use crate::monte_carlo::{RngMode, DEFAULT_EXPERIMENTS};
use crate::template::Binning;
use crate::FactoryError;

pub const LOG_LEVELS: [&str; 4] = ["debug", "info", "warn", "error"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    pub logging: String,
    pub seed: u64,
    pub number_of_experiments: usize,
    pub rng_mode: RngMode,
    pub store_root: String,
    pub hist_name: String,
    pub range_for_counts: Option<[f64; 2]>,
    pub components: Vec<ComponentConfig>,
    pub distortions: DistortionsConfig,
    pub output: OutputConfig,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            logging: "info".to_string(),
            seed: 0,
            number_of_experiments: DEFAULT_EXPERIMENTS,
            rng_mode: RngMode::Shared,
            store_root: ".".to_string(),
            hist_name: String::new(),
            range_for_counts: None,
            components: Vec::new(),
            distortions: DistortionsConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub name: String,
    pub source: SourceConfig,
    pub amount_cts: f64,
    #[serde(default)]
    pub hist_name: Option<String>,
    #[serde(default)]
    pub range_for_counts: Option<[f64; 2]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceConfig {
    /// Path(s) relative to `store_root`.
    Store(StoreRefs),
    /// A user-supplied single file, read as given.
    File(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoreRefs {
    Single(String),
    Weighted(BTreeMap<String, f64>),
}

impl StoreRefs {
    /// `(path, weight)` pairs with weights divided by their sum.
    pub fn normalized(&self) -> Vec<(String, f64)> {
        match self {
            StoreRefs::Single(path) => vec![(path.clone(), 1.0)],
            StoreRefs::Weighted(parts) => {
                let sum: f64 = parts.values().sum();
                parts
                    .iter()
                    .map(|(path, w)| (path.clone(), w / sum))
                    .collect()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistortionsConfig {
    pub prefix: String,
    pub global: Vec<GlobalRuleConfig>,
    pub specific: Vec<SpecificRuleConfig>,
}

impl Default for DistortionsConfig {
    fn default() -> Self {
        Self {
            prefix: ".".to_string(),
            global: Vec::new(),
            specific: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalRuleConfig {
    pub label: String,
    /// Empty means every store-sourced component.
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub mode: DistortionMode,
    /// `null` entries stand for "no distortion".
    pub candidates: Vec<Option<String>>,
    #[serde(default)]
    pub hist_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecificRuleConfig {
    pub component: String,
    #[serde(default)]
    pub mode: DistortionMode,
    pub candidates: Vec<Option<String>>,
    #[serde(default)]
    pub hist_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// `directory[:name]`; experiments are named `<name>_<i>`.
    pub file: String,
    pub number_of_bins: usize,
    pub xaxis_range: [f64; 2],
    pub rebin: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            file: "output-toyfactory".to_string(),
            number_of_bins: 8000,
            xaxis_range: [0.0, 8000.0],
            rebin: 1,
        }
    }
}

impl OutputConfig {
    pub fn target(&self) -> (PathBuf, String) {
        match self.file.split_once(':') {
            Some((dir, name)) if !name.is_empty() => (PathBuf::from(dir), name.to_string()),
            Some((dir, _)) => (PathBuf::from(dir), "h".to_string()),
            None => (PathBuf::from(&self.file), "h".to_string()),
        }
    }
}

impl FactoryConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, FactoryError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, FactoryError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn output_binning(&self) -> Result<Binning, FactoryError> {
        let [xmin, xmax] = self.output.xaxis_range;
        Binning::new(self.output.number_of_bins, xmin, xmax)
    }

    /// Object name used for a component: its own override, else the global one.
    pub fn object_name<'a>(&'a self, component: &'a ComponentConfig) -> &'a str {
        component.hist_name.as_deref().unwrap_or(&self.hist_name)
    }

    /// Normalization window for a component, `None` for the full range.
    pub fn counts_window(&self, component: &ComponentConfig) -> Option<[f64; 2]> {
        component
            .range_for_counts
            .or(self.range_for_counts)
            .filter(|[a, b]| !(*a == 0.0 && *b == 0.0))
    }

    pub fn validate(&self) -> Result<(), FactoryError> {
        if !LOG_LEVELS.contains(&self.logging.as_str()) {
            return Err(FactoryError::Config(format!(
                "logging must be one of {}, got '{}'",
                LOG_LEVELS.join(", "),
                self.logging
            )));
        }

        if self.number_of_experiments == 0 {
            return Err(FactoryError::Config(
                "number_of_experiments must be greater than zero".to_string(),
            ));
        }

        self.output_binning()?;
        if self.output.rebin == 0 {
            return Err(FactoryError::Config(
                "output rebin factor must be greater than zero".to_string(),
            ));
        }

        if let Some(range) = self.range_for_counts {
            validate_window("range_for_counts", range)?;
        }

        if self.components.is_empty() {
            return Err(FactoryError::Config("no components configured".to_string()));
        }

        let mut sources: HashMap<&str, &SourceConfig> = HashMap::new();
        for component in &self.components {
            self.validate_component(component)?;
            if sources
                .insert(component.name.as_str(), &component.source)
                .is_some()
            {
                return Err(FactoryError::Config(format!(
                    "duplicate component name '{}'",
                    component.name
                )));
            }
        }

        for rule in &self.distortions.global {
            validate_candidates(&rule.label, rule.mode, &rule.candidates)?;
            for name in &rule.components {
                match sources.get(name.as_str()) {
                    None => {
                        return Err(FactoryError::Config(format!(
                            "global distortion '{}' refers to unknown component '{name}'",
                            rule.label
                        )))
                    }
                    Some(SourceConfig::File(_)) => {
                        return Err(FactoryError::Config(format!(
                            "global distortion '{}' cannot target file-sourced component '{name}'",
                            rule.label
                        )))
                    }
                    Some(SourceConfig::Store(_)) => {}
                }
            }
        }

        for rule in &self.distortions.specific {
            validate_candidates(&rule.component, rule.mode, &rule.candidates)?;
            if !sources.contains_key(rule.component.as_str()) {
                return Err(FactoryError::Config(format!(
                    "specific distortion refers to unknown component '{}'",
                    rule.component
                )));
            }
        }

        Ok(())
    }

    fn validate_component(&self, component: &ComponentConfig) -> Result<(), FactoryError> {
        let name = &component.name;
        if name.is_empty() {
            return Err(FactoryError::Config(
                "component names must not be empty".to_string(),
            ));
        }
        if !component.amount_cts.is_finite() || component.amount_cts < 0.0 {
            return Err(FactoryError::Config(format!(
                "component '{name}': amount_cts must be finite and >= 0"
            )));
        }
        if self.object_name(component).is_empty() {
            return Err(FactoryError::Config(format!(
                "component '{name}': no hist_name given and no global default"
            )));
        }
        if let Some(range) = component.range_for_counts {
            validate_window(name, range)?;
        }
        match &component.source {
            SourceConfig::File(path) if path.is_empty() => Err(FactoryError::Config(format!(
                "component '{name}': empty file path"
            ))),
            SourceConfig::Store(StoreRefs::Single(path)) if path.is_empty() => Err(
                FactoryError::Config(format!("component '{name}': empty store path")),
            ),
            SourceConfig::Store(StoreRefs::Weighted(parts)) => {
                if parts.is_empty() {
                    return Err(FactoryError::Config(format!(
                        "component '{name}': empty store mixture"
                    )));
                }
                if parts.values().any(|w| !w.is_finite() || *w <= 0.0) {
                    return Err(FactoryError::Config(format!(
                        "component '{name}': mixture weights must be finite and > 0"
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn validate_window(context: &str, [a, b]: [f64; 2]) -> Result<(), FactoryError> {
    if !a.is_finite() || !b.is_finite() {
        return Err(FactoryError::Config(format!(
            "{context}: counts range must be finite"
        )));
    }
    if !(a == 0.0 && b == 0.0) && b < a {
        return Err(FactoryError::Config(format!(
            "{context}: invalid counts range [{a}, {b}]"
        )));
    }
    Ok(())
}

fn validate_candidates(
    context: &str,
    mode: DistortionMode,
    candidates: &[Option<String>],
) -> Result<(), FactoryError> {
    if candidates.is_empty() {
        return Err(FactoryError::Config(format!(
            "distortion '{context}' has no candidates"
        )));
    }
    if candidates
        .iter()
        .any(|c| c.as_deref().is_some_and(str::is_empty))
    {
        return Err(FactoryError::Config(format!(
            "distortion '{context}' has an empty candidate path"
        )));
    }
    if mode == DistortionMode::Interpolated && candidates.iter().any(Option::is_none) {
        return Err(FactoryError::Config(format!(
            "interpolated distortion '{context}' cannot have a null candidate"
        )));
    }
    Ok(())
}
