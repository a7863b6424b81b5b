//! Scoring adapter: standardization followed by a binary classifier, both
//! loaded from an offline-trained artifact file.
//!
//! A [`Scorer`] is immutable once built and is shared behind an `Arc` by every
//! request. [`ScorerHandle`] adds an explicit reload that swaps in a freshly
//! validated scorer without pausing in-flight requests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::info;

use crate::error::ScoringError;
use crate::features::{matches_schema, FEATURE_DIM};

// ---------- Artifact file ----------

#[derive(Debug, Deserialize)]
struct ArtifactJson {
    version: String,
    #[serde(default)]
    feature_names: Option<Vec<String>>,
    scaler: Standardizer,
    classifier: ClassifierSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassifierSpec {
    Logistic {
        coef: Vec<f64>,
        intercept: f64,
    },
    Forest {
        n_features: usize,
        trees: Vec<Tree>,
    },
    /// TorchScript module; `path` is relative to the artifact file.
    Torchscript { path: String },
}

// ---------- Standardization ----------

/// Fitted per-feature `(x - mean) / scale`.
#[derive(Debug, Clone, Deserialize)]
pub struct Standardizer {
    mean: Vec<f64>,
    scale: Vec<f64>,
}

impl Standardizer {
    pub fn new(mean: Vec<f64>, scale: Vec<f64>) -> Result<Self, ScoringError> {
        let s = Self { mean, scale };
        s.validate()?;
        Ok(s)
    }

    fn validate(&self) -> Result<(), ScoringError> {
        check_len("scaler mean", self.mean.len(), FEATURE_DIM)?;
        check_len("scaler scale", self.scale.len(), FEATURE_DIM)?;
        if self.mean.iter().chain(&self.scale).any(|x| !x.is_finite()) {
            return Err(ScoringError::Invalid("scaler has non-finite values".into()));
        }
        Ok(())
    }

    pub fn transform(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .zip(self.mean.iter().zip(&self.scale))
            // constant training columns were fitted with scale 0
            .map(|(v, (m, s))| if *s == 0.0 { v - m } else { (v - m) / s })
            .collect()
    }
}

fn check_len(what: &'static str, got: usize, expected: usize) -> Result<(), ScoringError> {
    if got != expected {
        return Err(ScoringError::Dimension {
            what,
            got,
            expected,
        });
    }
    Ok(())
}

// ---------- Classifiers ----------

pub trait Classifier: Send + Sync {
    fn n_features(&self) -> usize;

    /// Probability of class 1 for one standardized row.
    fn predict_proba(&self, x: &[f64]) -> Result<f64, ScoringError>;
}

pub struct Logistic {
    coef: Vec<f64>,
    intercept: f64,
}

impl Classifier for Logistic {
    fn n_features(&self) -> usize {
        self.coef.len()
    }

    fn predict_proba(&self, x: &[f64]) -> Result<f64, ScoringError> {
        let z = self.intercept + x.iter().zip(&self.coef).map(|(a, b)| a * b).sum::<f64>();
        Ok(1.0 / (1.0 + (-z).exp()))
    }
}

/// One exported decision tree in parallel-array form. Node 0 is the root, a
/// node with `children_left == -1` is a leaf, and `value` holds the per-class
/// weights seen at each node.
#[derive(Debug, Clone, Deserialize)]
pub struct Tree {
    children_left: Vec<i64>,
    children_right: Vec<i64>,
    feature: Vec<i64>,
    threshold: Vec<f64>,
    value: Vec<Vec<f64>>,
}

impl Tree {
    fn validate(&self, n_features: usize) -> Result<(), ScoringError> {
        let n = self.children_left.len();
        if n == 0 {
            return Err(ScoringError::Invalid("empty tree".into()));
        }
        for (what, len) in [
            ("tree children_right", self.children_right.len()),
            ("tree feature", self.feature.len()),
            ("tree threshold", self.threshold.len()),
            ("tree value", self.value.len()),
        ] {
            check_len(what, len, n)?;
        }
        for i in 0..n {
            let (l, r) = (self.children_left[i], self.children_right[i]);
            if l < 0 {
                if self.value[i].len() < 2 {
                    return Err(ScoringError::Invalid(format!(
                        "leaf {i} has {} class weights, expected 2",
                        self.value[i].len()
                    )));
                }
                continue;
            }
            // children always come after their parent, which also rules out cycles
            let child_ok = |c: i64| c > i as i64 && (c as usize) < n;
            if !child_ok(l) || !child_ok(r) {
                return Err(ScoringError::Invalid(format!("node {i} has bad children ({l}, {r})")));
            }
            let f = self.feature[i];
            if f < 0 || f as usize >= n_features {
                return Err(ScoringError::Invalid(format!("node {i} splits on feature {f}")));
            }
        }
        Ok(())
    }

    fn leaf_proba(&self, x: &[f64]) -> f64 {
        let mut node = 0usize;
        loop {
            let left = self.children_left[node];
            if left < 0 {
                let w = &self.value[node];
                let total = w[0] + w[1];
                return if total > 0.0 { w[1] / total } else { 0.0 };
            }
            node = if x[self.feature[node] as usize] <= self.threshold[node] {
                left as usize
            } else {
                self.children_right[node] as usize
            };
        }
    }
}

pub struct Forest {
    n_features: usize,
    trees: Vec<Tree>,
}

impl Classifier for Forest {
    fn n_features(&self) -> usize {
        self.n_features
    }

    fn predict_proba(&self, x: &[f64]) -> Result<f64, ScoringError> {
        let sum: f64 = self.trees.iter().map(|t| t.leaf_proba(x)).sum();
        Ok(sum / self.trees.len() as f64)
    }
}

#[cfg(feature = "torch")]
mod torch {
    use tch::{kind::Kind, CModule, Device, Tensor};

    use super::Classifier;
    use crate::error::ScoringError;

    pub struct TorchClassifier {
        model: CModule,
        n_features: usize,
        two_class: bool,
    }

    impl TorchClassifier {
        pub fn load(path: &str, n_features: usize) -> Result<Self, ScoringError> {
            let model = CModule::load_on_device(path, Device::Cpu)
                .map_err(|e| ScoringError::Invalid(format!("failed to load TorchScript {path}: {e}")))?;

            // Check output shape: expect [1, 1] (logit) or [1, 2] (class logits)
            let dummy = Tensor::zeros([1, n_features as i64], (Kind::Float, Device::Cpu));
            let out = model
                .forward_ts(&[dummy])
                .map_err(|e| ScoringError::Classifier(e.to_string()))?;
            let two_class = match out.size().as_slice() {
                [1, 1] => false,
                [1, 2] => true,
                sz => {
                    return Err(ScoringError::Invalid(format!(
                        "unexpected model output size: {sz:?}"
                    )))
                }
            };
            Ok(Self {
                model,
                n_features,
                two_class,
            })
        }
    }

    impl Classifier for TorchClassifier {
        fn n_features(&self) -> usize {
            self.n_features
        }

        fn predict_proba(&self, x: &[f64]) -> Result<f64, ScoringError> {
            let row: Vec<f32> = x.iter().map(|v| *v as f32).collect();
            let input = Tensor::from_slice(&row).reshape([1, self.n_features as i64]);
            let out = self
                .model
                .forward_ts(&[input])
                .map_err(|e| ScoringError::Classifier(e.to_string()))?;
            let p = if self.two_class {
                out.softmax(-1, Kind::Float).double_value(&[0, 1])
            } else {
                out.sigmoid().double_value(&[0, 0])
            };
            Ok(p)
        }
    }
}

fn build_classifier(
    def: ClassifierSpec,
    base_dir: &Path,
) -> Result<Box<dyn Classifier>, ScoringError> {
    match def {
        ClassifierSpec::Logistic { coef, intercept } => {
            if !intercept.is_finite() || coef.iter().any(|c| !c.is_finite()) {
                return Err(ScoringError::Invalid("logistic weights are not finite".into()));
            }
            Ok(Box::new(Logistic { coef, intercept }))
        }
        ClassifierSpec::Forest { n_features, trees } => {
            if trees.is_empty() {
                return Err(ScoringError::Invalid("forest has no trees".into()));
            }
            for t in &trees {
                t.validate(n_features)?;
            }
            Ok(Box::new(Forest { n_features, trees }))
        }
        #[cfg(feature = "torch")]
        ClassifierSpec::Torchscript { path } => {
            let full = base_dir.join(path);
            let full = full.to_string_lossy();
            Ok(Box::new(torch::TorchClassifier::load(&full, FEATURE_DIM)?))
        }
        #[cfg(not(feature = "torch"))]
        ClassifierSpec::Torchscript { path } => {
            let _ = base_dir;
            Err(ScoringError::Invalid(format!(
                "TorchScript classifier {path} needs the `torch` feature"
            )))
        }
    }
}

// ---------- Scorer ----------

pub struct Scorer {
    version: String,
    scaler: Standardizer,
    classifier: Box<dyn Classifier>,
}

impl std::fmt::Debug for Scorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scorer")
            .field("version", &self.version)
            .field("n_features", &self.classifier.n_features())
            .finish()
    }
}

impl Scorer {
    pub fn load(path: &Path) -> Result<Self, ScoringError> {
        let shown = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ScoringError::Missing { path: shown.clone() },
            _ => ScoringError::Io {
                path: shown.clone(),
                source: e,
            },
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_json(&text, &shown, base_dir)
    }

    pub fn from_json(text: &str, source_name: &str, base_dir: &Path) -> Result<Self, ScoringError> {
        let art: ArtifactJson = serde_json::from_str(text).map_err(|e| ScoringError::Parse {
            path: source_name.to_string(),
            source: e,
        })?;
        if let Some(names) = art.feature_names {
            if !matches_schema(&names) {
                return Err(ScoringError::FeatureNames { got: names });
            }
        }
        let classifier = build_classifier(art.classifier, base_dir)?;
        Self::new(art.version, art.scaler, classifier)
    }

    pub fn new(
        version: impl Into<String>,
        scaler: Standardizer,
        classifier: Box<dyn Classifier>,
    ) -> Result<Self, ScoringError> {
        scaler.validate()?;
        check_len("classifier input", classifier.n_features(), FEATURE_DIM)?;
        Ok(Self {
            version: version.into(),
            scaler,
            classifier,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Class-1 probability for one feature vector, clamped into [0, 1].
    pub fn score(&self, x: &[f64]) -> Result<f64, ScoringError> {
        check_len("feature vector", x.len(), FEATURE_DIM)?;
        let xs = self.scaler.transform(x);
        let p = self.classifier.predict_proba(&xs)?;
        if !p.is_finite() {
            return Err(ScoringError::Classifier(format!("non-finite probability {p}")));
        }
        Ok(p.clamp(0.0, 1.0))
    }
}

/// Current scorer plus the file it came from.
pub struct ScorerHandle {
    current: RwLock<Arc<Scorer>>,
    path: Option<PathBuf>,
}

impl ScorerHandle {
    pub fn new(scorer: Scorer, path: Option<PathBuf>) -> Self {
        Self {
            current: RwLock::new(Arc::new(scorer)),
            path,
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ScoringError> {
        let path = path.into();
        let scorer = Scorer::load(&path)?;
        Ok(Self::new(scorer, Some(path)))
    }

    pub fn current(&self) -> Arc<Scorer> {
        Arc::clone(&self.current.read())
    }

    /// Re-read the artifact file and swap it in. The old scorer stays active
    /// if the new one fails to load.
    pub fn reload(&self) -> Result<String, ScoringError> {
        let path = self.path.as_ref().ok_or_else(|| ScoringError::Missing {
            path: "<no artifact path configured>".into(),
        })?;
        let scorer = Scorer::load(path)?;
        let version = scorer.version().to_string();
        *self.current.write() = Arc::new(scorer);
        info!(%version, path = %path.display(), "reloaded scoring artifacts");
        Ok(version)
    }
}
