//! Template store adapters.
//!
//! A store resolves a `(path, object)` reference to a [`Template`]. Stored
//! objects are either binned distributions or parametric shapes that get
//! evaluated at the bin centres of the run binning; both are turned into a
//! [`SourceObject`] at load time. Objects following the `M1_`/`M2_` naming
//! convention are divided by the primary count recorded next to them.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::template::{Binning, Template};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object '{object}' not found at '{path}'")]
    NotFound { path: String, object: String },
    #[error("object '{object}' at '{path}' has an unsupported shape: {reason}")]
    UnsupportedShape {
        path: String,
        object: String,
        reason: String,
    },
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub trait TemplateStore {
    fn get(&mut self, path: &str, object: &str) -> Result<Template, StoreError>;
}

impl<S: TemplateStore + ?Sized> TemplateStore for &mut S {
    fn get(&mut self, path: &str, object: &str) -> Result<Template, StoreError> {
        (**self).get(path, object)
    }
}

/// Parameter holding the primary count for an object name, if the name
/// follows a recognized prefix convention.
pub fn primaries_parameter(object: &str) -> Option<&'static str> {
    if object.starts_with("M1_") {
        Some("NumberOfPrimariesEdep")
    } else if object.starts_with("M2_") {
        Some("NumberOfPrimariesCoin")
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParametricShape {
    Constant { value: f64 },
    Polynomial { coefficients: Vec<f64> },
    Exponential { amplitude: f64, slope: f64 },
    Gaussian { amplitude: f64, mean: f64, sigma: f64 },
}

impl ParametricShape {
    pub fn eval(&self, x: f64) -> f64 {
        match self {
            ParametricShape::Constant { value } => *value,
            // Horner, highest order last in the list.
            ParametricShape::Polynomial { coefficients } => coefficients
                .iter()
                .rev()
                .fold(0.0, |acc, c| acc * x + c),
            ParametricShape::Exponential { amplitude, slope } => amplitude * (slope * x).exp(),
            ParametricShape::Gaussian {
                amplitude,
                mean,
                sigma,
            } => {
                let z = (x - mean) / sigma;
                amplitude * (-0.5 * z * z).exp()
            }
        }
    }

    fn check(&self) -> Result<(), String> {
        match self {
            ParametricShape::Gaussian { sigma, .. } if !(*sigma > 0.0) => {
                Err(format!("gaussian sigma must be > 0, got {sigma}"))
            }
            ParametricShape::Polynomial { coefficients } if coefficients.is_empty() => {
                Err("polynomial needs at least one coefficient".to_string())
            }
            _ => Ok(()),
        }
    }

    /// Sample the shape at every bin centre. Negative values are clamped to 0.
    pub fn evaluate(&self, binning: Binning) -> Result<Template, String> {
        self.check()?;
        let contents = (0..binning.n_bins())
            .map(|bin| self.eval(binning.center(bin)).max(0.0))
            .collect::<Vec<_>>();
        if contents.iter().any(|c| !c.is_finite()) {
            return Err("shape evaluates to a non-finite value".to_string());
        }
        Template::from_contents(binning, contents).map_err(|err| err.to_string())
    }
}

/// On-disk representation of one object in a template file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoredObject {
    Binned {
        xmin: f64,
        xmax: f64,
        contents: Vec<f64>,
    },
    Parametric(ParametricShape),
    #[serde(rename = "binned_2d")]
    Binned2d(serde_json::Value),
}

/// A store object resolved to one of the two supported shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceObject {
    Binned(Template),
    Parametric(ParametricShape),
}

impl SourceObject {
    fn from_stored(path: &str, object: &str, stored: StoredObject) -> Result<Self, StoreError> {
        let unsupported = |reason: String| StoreError::UnsupportedShape {
            path: path.to_string(),
            object: object.to_string(),
            reason,
        };
        match stored {
            StoredObject::Binned {
                xmin,
                xmax,
                contents,
            } => {
                let binning = Binning::new(contents.len(), xmin, xmax)
                    .map_err(|err| unsupported(err.to_string()))?;
                let template = Template::from_contents(binning, contents)
                    .map_err(|err| unsupported(err.to_string()))?;
                Ok(SourceObject::Binned(template))
            }
            StoredObject::Parametric(shape) => Ok(SourceObject::Parametric(shape)),
            StoredObject::Binned2d(_) => Err(unsupported(
                "only one-dimensional objects are supported".to_string(),
            )),
        }
    }

    /// Produce the template, dividing binned objects by the primary count.
    fn into_template(
        self,
        path: &str,
        object: &str,
        binning: Binning,
        parameters: Option<&BTreeMap<String, f64>>,
    ) -> Result<Template, StoreError> {
        let unsupported = |reason: String| StoreError::UnsupportedShape {
            path: path.to_string(),
            object: object.to_string(),
            reason,
        };
        match self {
            SourceObject::Binned(mut template) => {
                let divisor = primaries_parameter(object)
                    .and_then(|key| parameters.and_then(|p| p.get(key)).copied())
                    .unwrap_or(1.0);
                if !(divisor > 0.0) || !divisor.is_finite() {
                    return Err(unsupported(format!("invalid primary count {divisor}")));
                }
                if divisor != 1.0 {
                    debug!(path, object, divisor, "normalizing by primary count");
                    template.scale(1.0 / divisor);
                }
                Ok(template)
            }
            SourceObject::Parametric(shape) => shape.evaluate(binning).map_err(unsupported),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateFile {
    #[serde(default)]
    pub parameters: BTreeMap<String, f64>,
    #[serde(default)]
    pub objects: BTreeMap<String, StoredObject>,
}

/// Store backed by JSON template files under a root directory.
#[derive(Debug, Clone)]
pub struct JsonTemplateStore {
    root: PathBuf,
    binning: Binning,
}

impl JsonTemplateStore {
    /// `binning` is used to evaluate parametric objects.
    pub fn new(root: impl Into<PathBuf>, binning: Binning) -> Self {
        Self {
            root: root.into(),
            binning,
        }
    }

    fn resolve_file(&self, path: &str) -> Option<PathBuf> {
        let direct = self.root.join(path);
        if direct.is_file() {
            return Some(direct);
        }
        let mut with_ext = direct.into_os_string();
        with_ext.push(".json");
        let with_ext = PathBuf::from(with_ext);
        with_ext.is_file().then_some(with_ext)
    }

    fn read_file(path: &str, file: &Path) -> Result<TemplateFile, StoreError> {
        let raw = fs::read_to_string(file).map_err(|source| StoreError::Io {
            path: path.to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| StoreError::Parse {
            path: path.to_string(),
            source,
        })
    }
}

impl TemplateStore for JsonTemplateStore {
    fn get(&mut self, path: &str, object: &str) -> Result<Template, StoreError> {
        let not_found = || StoreError::NotFound {
            path: path.to_string(),
            object: object.to_string(),
        };
        let file = self.resolve_file(path).ok_or_else(not_found)?;
        debug!(file = %file.display(), object, "reading template file");
        let mut contents = Self::read_file(path, &file)?;
        let stored = contents.objects.remove(object).ok_or_else(not_found)?;
        SourceObject::from_stored(path, object, stored)?.into_template(
            path,
            object,
            self.binning,
            Some(&contents.parameters),
        )
    }
}

/// In-memory store, keyed by `(path, object)`.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    binning: Binning,
    objects: HashMap<(String, String), SourceObject>,
    parameters: HashMap<String, BTreeMap<String, f64>>,
    lookups: usize,
}

impl MemoryStore {
    pub fn new(binning: Binning) -> Self {
        Self {
            binning,
            objects: HashMap::new(),
            parameters: HashMap::new(),
            lookups: 0,
        }
    }

    pub fn insert_template(&mut self, path: &str, object: &str, template: Template) {
        self.objects.insert(
            (path.to_string(), object.to_string()),
            SourceObject::Binned(template),
        );
    }

    pub fn insert_parametric(&mut self, path: &str, object: &str, shape: ParametricShape) {
        self.objects.insert(
            (path.to_string(), object.to_string()),
            SourceObject::Parametric(shape),
        );
    }

    pub fn set_parameter(&mut self, path: &str, name: &str, value: f64) {
        self.parameters
            .entry(path.to_string())
            .or_default()
            .insert(name.to_string(), value);
    }

    /// Number of `get` calls served so far, hits and misses alike.
    pub fn lookups(&self) -> usize {
        self.lookups
    }
}

impl TemplateStore for MemoryStore {
    fn get(&mut self, path: &str, object: &str) -> Result<Template, StoreError> {
        self.lookups += 1;
        let source = self
            .objects
            .get(&(path.to_string(), object.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                path: path.to_string(),
                object: object.to_string(),
            })?;
        source.into_template(path, object, self.binning, self.parameters.get(path))
    }
}

/// Memoizes lookups for the lifetime of a run, misses included. Every call
/// hands out its own deep copy.
#[derive(Debug)]
pub struct CachedStore<S> {
    inner: S,
    /// `None` records a reference the inner store reported as not found.
    cache: HashMap<(String, String), Option<Template>>,
}

impl<S: TemplateStore> CachedStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            cache: HashMap::new(),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

impl<S: TemplateStore> TemplateStore for CachedStore<S> {
    fn get(&mut self, path: &str, object: &str) -> Result<Template, StoreError> {
        let key = (path.to_string(), object.to_string());
        if let Some(entry) = self.cache.get(&key) {
            return entry.clone().ok_or_else(|| StoreError::NotFound {
                path: path.to_string(),
                object: object.to_string(),
            });
        }
        match self.inner.get(path, object) {
            Ok(template) => {
                self.cache.insert(key, Some(template.clone()));
                Ok(template)
            }
            Err(err) if err.is_not_found() => {
                self.cache.insert(key, None);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}
