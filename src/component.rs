//! Base components: a named template with a target yield.

use tracing::debug;

use crate::config::{FactoryConfig, SourceConfig};
use crate::model::NormalizationWindow;
use crate::store::TemplateStore;
use crate::template::{Binning, Template};
use crate::FactoryError;

/// Where a component's template comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentSource {
    /// Weighted mixture of store paths (weights sum to 1), resolved under a root.
    Store { parts: Vec<(String, f64)> },
    /// A user-supplied file, never subject to global distortions.
    File { path: String },
}

/// A named, yield-scaled template. Each instance owns its template; cloning
/// produces an independent deep copy.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentSpec {
    pub name: String,
    pub template: Template,
    pub target_yield: f64,
    pub window: Option<NormalizationWindow>,
    pub source: ComponentSource,
    /// Object name the template was read from.
    pub object: String,
}

impl ComponentSpec {
    /// Component not tied to any store, with an explicit template.
    pub fn new(name: &str, template: Template, target_yield: f64) -> Self {
        Self {
            name: name.to_string(),
            template,
            target_yield,
            window: None,
            source: ComponentSource::Store {
                parts: vec![(name.to_string(), 1.0)],
            },
            object: String::new(),
        }
    }

    pub fn with_window(mut self, window: NormalizationWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub fn with_source(mut self, source: ComponentSource, object: &str) -> Self {
        self.source = source;
        self.object = object.to_string();
        self
    }
}

/// Join a store root and a relative path with `/`.
pub fn join_store_path(root: &str, path: &str) -> String {
    let root = root.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if root.is_empty() || root == "." {
        path.to_string()
    } else {
        format!("{root}/{path}")
    }
}

/// Resolve a weighted mixture of store paths under `root`.
pub fn resolve_mixture<S: TemplateStore + ?Sized>(
    store: &mut S,
    root: &str,
    parts: &[(String, f64)],
    object: &str,
) -> Result<Template, FactoryError> {
    let mut sum: Option<Template> = None;
    for (path, weight) in parts {
        let full = join_store_path(root, path);
        debug!(path = %full, object, weight, "summing template part");
        let part = store.get(&full, object)?;
        match sum.as_mut() {
            Some(total) => total.add(&part, *weight)?,
            None => {
                let mut first = part;
                first.scale(*weight);
                sum = Some(first);
            }
        }
    }
    sum.ok_or_else(|| FactoryError::Config(format!("empty mixture for object '{object}'")))
}

/// Load every configured component from the store. A component that cannot
/// be found aborts the run; all templates must share `binning`.
pub fn load_components<S: TemplateStore + ?Sized>(
    config: &FactoryConfig,
    store: &mut S,
    binning: &Binning,
) -> Result<Vec<ComponentSpec>, FactoryError> {
    let mut components = Vec::with_capacity(config.components.len());

    for entry in &config.components {
        debug!(component = %entry.name, "building template");
        let object = config.object_name(entry);
        let source = match &entry.source {
            SourceConfig::Store(refs) => ComponentSource::Store {
                parts: refs.normalized(),
            },
            SourceConfig::File(path) => ComponentSource::File { path: path.clone() },
        };

        let loaded = match &source {
            ComponentSource::Store { parts } => {
                resolve_mixture(store, &config.store_root, parts, object)
            }
            ComponentSource::File { path } => store.get(path, object).map_err(FactoryError::from),
        };
        let template = loaded.map_err(|err| match err {
            FactoryError::Store(inner) if inner.is_not_found() => FactoryError::Lookup {
                path: describe_source(&source),
                object: object.to_string(),
            },
            other => other,
        })?;

        if !template.binning().is_compatible(binning) {
            return Err(FactoryError::Config(format!(
                "component '{}' has {} but the output uses {}",
                entry.name,
                template.binning().describe(),
                binning.describe()
            )));
        }

        components.push(ComponentSpec {
            name: entry.name.clone(),
            template,
            target_yield: entry.amount_cts,
            window: config
                .counts_window(entry)
                .map(|[a, b]| NormalizationWindow::new(a, b)),
            source,
            object: object.to_string(),
        });
    }

    Ok(components)
}

fn describe_source(source: &ComponentSource) -> String {
    match source {
        ComponentSource::Store { parts } => parts
            .iter()
            .map(|(path, _)| path.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        ComponentSource::File { path } => path.clone(),
    }
}
