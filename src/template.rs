//! One-dimensional binned templates.
//!
//! A [`Template`] has a fixed axis (`xmin`, `xmax`, bin count) and mutable
//! non-negative bin contents. Operations that combine two templates require
//! identical binning and clamp negative contents to zero afterwards without
//! restoring the pre-clamp integral.

use serde::Serialize;

use crate::FactoryError;

/// Relative tolerance used when comparing axis edges.
const EDGE_TOLERANCE: f64 = 1e-9;

/// Fixed axis of a template. Only constructible through [`Binning::new`], so
/// every value has at least one bin and an increasing finite range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Binning {
    n_bins: usize,
    xmin: f64,
    xmax: f64,
}

impl Binning {
    pub fn new(n_bins: usize, xmin: f64, xmax: f64) -> Result<Self, FactoryError> {
        if n_bins == 0 {
            return Err(FactoryError::Config(
                "binning must have at least one bin".to_string(),
            ));
        }
        if !xmin.is_finite() || !xmax.is_finite() || xmax <= xmin {
            return Err(FactoryError::Config(format!(
                "invalid axis range [{xmin}, {xmax}]"
            )));
        }
        Ok(Self { n_bins, xmin, xmax })
    }

    pub fn n_bins(&self) -> usize {
        self.n_bins
    }

    pub fn xmin(&self) -> f64 {
        self.xmin
    }

    pub fn xmax(&self) -> f64 {
        self.xmax
    }

    pub fn bin_width(&self) -> f64 {
        (self.xmax - self.xmin) / self.n_bins as f64
    }

    pub fn low_edge(&self, bin: usize) -> f64 {
        self.xmin + bin as f64 * self.bin_width()
    }

    pub fn high_edge(&self, bin: usize) -> f64 {
        self.low_edge(bin + 1)
    }

    pub fn center(&self, bin: usize) -> f64 {
        self.xmin + (bin as f64 + 0.5) * self.bin_width()
    }

    /// Index of the bin containing `x`, clamped to the axis.
    pub fn find_bin(&self, x: f64) -> usize {
        if x <= self.xmin {
            return 0;
        }
        let idx = ((x - self.xmin) / self.bin_width()).floor() as usize;
        idx.min(self.n_bins - 1)
    }

    pub fn is_compatible(&self, other: &Binning) -> bool {
        let scale = (self.xmax - self.xmin).abs().max(1.0);
        self.n_bins == other.n_bins
            && (self.xmin - other.xmin).abs() <= EDGE_TOLERANCE * scale
            && (self.xmax - other.xmax).abs() <= EDGE_TOLERANCE * scale
    }

    pub fn describe(&self) -> String {
        format!("{} bins in [{}, {}]", self.n_bins, self.xmin, self.xmax)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    binning: Binning,
    contents: Vec<f64>,
}

impl Template {
    /// Empty template with every bin at zero.
    pub fn zeros(binning: Binning) -> Self {
        Self {
            binning,
            contents: vec![0.0; binning.n_bins],
        }
    }

    pub fn from_contents(binning: Binning, contents: Vec<f64>) -> Result<Self, FactoryError> {
        if contents.len() != binning.n_bins {
            return Err(FactoryError::BinningMismatch {
                context: "template contents",
                expected: binning.describe(),
                got: format!("{} values", contents.len()),
            });
        }
        if let Some(bad) = contents.iter().find(|c| !c.is_finite()) {
            return Err(FactoryError::Numeric(format!(
                "template contains a non-finite bin content ({bad})"
            )));
        }
        Ok(Self { binning, contents })
    }

    pub fn binning(&self) -> &Binning {
        &self.binning
    }

    pub fn contents(&self) -> &[f64] {
        &self.contents
    }

    pub fn scale(&mut self, k: f64) {
        self.contents.iter_mut().for_each(|c| *c *= k);
    }

    /// `self += w * other`, bin by bin.
    pub fn add(&mut self, other: &Template, w: f64) -> Result<(), FactoryError> {
        self.ensure_same_binning("add", other)?;
        for (c, o) in self.contents.iter_mut().zip(&other.contents) {
            *c += w * o;
        }
        self.clamp_negative();
        Ok(())
    }

    pub fn multiply(&mut self, other: &Template) -> Result<(), FactoryError> {
        self.ensure_same_binning("multiply", other)?;
        for (c, o) in self.contents.iter_mut().zip(&other.contents) {
            *c *= o;
        }
        self.clamp_negative();
        Ok(())
    }

    /// Elementwise division. A bin divided by zero is set to 0 instead of a
    /// non-finite value.
    pub fn divide(&mut self, other: &Template) -> Result<(), FactoryError> {
        self.ensure_same_binning("divide", other)?;
        for (c, o) in self.contents.iter_mut().zip(&other.contents) {
            *c = if *o == 0.0 { 0.0 } else { *c / o };
        }
        self.clamp_negative();
        Ok(())
    }

    /// Sum of all bin contents.
    pub fn integral(&self) -> f64 {
        self.contents.iter().sum()
    }

    /// Sum over the bins covering `[a, b]`, both end bins included.
    pub fn integral_range(&self, a: f64, b: f64) -> f64 {
        let first = self.binning.find_bin(a);
        let last = self.binning.find_bin(b);
        if last < first {
            return 0.0;
        }
        self.contents[first..=last].iter().sum()
    }

    /// Scale so that the full-range integral equals `target`.
    pub fn normalize_to(&mut self, target: f64) -> Result<(), FactoryError> {
        let current = self.integral();
        if current == 0.0 || !current.is_finite() {
            return Err(FactoryError::Numeric(format!(
                "cannot renormalize a template with integral {current}"
            )));
        }
        self.scale(target / current);
        Ok(())
    }

    fn clamp_negative(&mut self) {
        for c in &mut self.contents {
            if *c < 0.0 {
                *c = 0.0;
            }
        }
    }

    fn ensure_same_binning(
        &self,
        context: &'static str,
        other: &Template,
    ) -> Result<(), FactoryError> {
        if self.binning.is_compatible(&other.binning) {
            return Ok(());
        }
        Err(FactoryError::BinningMismatch {
            context,
            expected: self.binning.describe(),
            got: other.binning.describe(),
        })
    }
}
