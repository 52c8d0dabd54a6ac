//! Marks: annotations that expand a test function into concrete test cases.
//!
//! A test function carries a vector of marks, collected by the loader in
//! the order the annotations take effect (innermost first). Expansion is a
//! fold: each mark's [`apply`](Mark::apply) transforms the accumulated
//! list of [`TestContext`]s, starting from either the bare seed context or
//! an empty list when any parametrizing mark is present.
//!
//! | Mark | Effect on the context list |
//! |------|---------------------------|
//! | [`Parametrize`](Mark::Parametrize) | Prepends one context with the given args |
//! | [`Matrix`](Mark::Matrix) | Prepends one context per cartesian-product element |
//! | [`Defaults`](Mark::Defaults) | Fills unbound axes of every existing context |
//! | [`Ignore`](Mark::Ignore) | Flags matching contexts (or all) as ignored |
//! | [`Env`](Mark::Env) | Flags all contexts as ignored unless the environment matches |
//! | [`ClusterUse`](Mark::ClusterUse) | Attaches resource hints, never overwriting |

pub mod expander;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cluster::ClusterSpec;
use crate::test::context::{ArgMap, TestContext};

pub use expander::MarkedFunctionExpander;

/// Value axes for the matrix and defaults marks: argument name to the
/// list of values it ranges over. Key-ordered for deterministic products.
pub type AxisMap = BTreeMap<String, Vec<Value>>;

/// Errors raised while applying marks.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MarkError {
    #[error("ignore annotation is not being applied to any test cases")]
    IgnoreWithoutTargets,

    #[error("cluster use annotation is not being applied to any test cases")]
    ClusterUseWithoutTargets,
}

/// Resource hints attached by the cluster-use mark.
///
/// `num_nodes`/`node_type` and `cluster_spec` are alternative spellings;
/// an explicit spec wins. Metadata that specifies neither asks for zero
/// nodes — distinct from a test with *no* metadata, which claims the
/// whole cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterUseMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_nodes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_spec: Option<ClusterSpec>,
}

impl ClusterUseMetadata {
    pub fn num_nodes(num_nodes: usize) -> Self {
        Self {
            num_nodes: Some(num_nodes),
            ..Self::default()
        }
    }

    pub fn with_node_type(mut self, node_type: impl Into<String>) -> Self {
        self.node_type = Some(node_type.into());
        self
    }

    pub fn spec(cluster_spec: ClusterSpec) -> Self {
        Self {
            cluster_spec: Some(cluster_spec),
            ..Self::default()
        }
    }

    /// The cluster spec this metadata resolves to.
    pub fn expected_spec(&self) -> ClusterSpec {
        if let Some(spec) = &self.cluster_spec {
            return spec.clone();
        }
        match (self.num_nodes, &self.node_type) {
            (Some(n), Some(t)) => ClusterSpec::simple_linux_of_type(n, t.clone()),
            (Some(n), None) => ClusterSpec::simple_linux(n),
            (None, _) => ClusterSpec::empty(),
        }
    }
}

/// A single annotation on a test function.
#[derive(Debug, Clone, PartialEq)]
pub enum Mark {
    /// One concrete parametrization.
    Parametrize(ArgMap),

    /// A matrix of parametrizations: the cartesian product of the axes.
    Matrix(AxisMap),

    /// Default values for axes not already bound by earlier
    /// parametrizations. With no prior parametrizations, acts as a matrix.
    Defaults(AxisMap),

    /// Ignore contexts whose args match exactly; `None` ignores all.
    Ignore(Option<ArgMap>),

    /// Ignore all contexts unless every listed environment variable has
    /// the listed value in the host environment.
    Env(BTreeMap<String, String>),

    /// Resource hints for the scheduler and allocator.
    ClusterUse(ClusterUseMetadata),
}

impl Mark {
    /// Whether this mark generates parametrizations (and therefore makes
    /// the expansion start from an empty list instead of the bare seed).
    pub fn is_parametrizing(&self) -> bool {
        matches!(
            self,
            Mark::Parametrize(_) | Mark::Matrix(_) | Mark::Defaults(_)
        )
    }

    /// Applies this mark to the accumulated context list.
    pub fn apply(
        &self,
        seed: &TestContext,
        mut acc: Vec<TestContext>,
    ) -> Result<Vec<TestContext>, MarkError> {
        match self {
            Mark::Parametrize(args) => {
                acc.insert(0, seed.with_injected_args(args.clone()));
                Ok(acc)
            }

            Mark::Matrix(axes) => {
                for args in cartesian_product_args(axes) {
                    acc.insert(0, seed.with_injected_args(args));
                }
                Ok(acc)
            }

            Mark::Defaults(axes) => {
                if acc.is_empty() {
                    return Mark::Matrix(axes.clone()).apply(seed, acc);
                }
                let mut expanded = Vec::new();
                for ctx in &acc {
                    let unbound: AxisMap = axes
                        .iter()
                        .filter(|(name, _)| !ctx.injected_args.contains_key(*name))
                        .map(|(name, values)| (name.clone(), values.clone()))
                        .collect();
                    for mut args in cartesian_product_args(&unbound) {
                        for (name, value) in &ctx.injected_args {
                            args.insert(name.clone(), value.clone());
                        }
                        expanded.insert(0, seed.with_injected_args(args));
                    }
                }
                Ok(expanded)
            }

            Mark::Ignore(matching) => {
                if acc.is_empty() {
                    return Err(MarkError::IgnoreWithoutTargets);
                }
                for ctx in &mut acc {
                    ctx.ignore = ctx.ignore
                        || match matching {
                            None => true,
                            Some(args) => *args == ctx.injected_args,
                        };
                }
                Ok(acc)
            }

            Mark::Env(vars) => {
                let should_ignore = vars
                    .iter()
                    .any(|(name, value)| std::env::var(name).ok().as_deref() != Some(value.as_str()));
                for ctx in &mut acc {
                    ctx.ignore = ctx.ignore || should_ignore;
                }
                Ok(acc)
            }

            Mark::ClusterUse(metadata) => {
                if acc.is_empty() {
                    return Err(MarkError::ClusterUseWithoutTargets);
                }
                for ctx in &mut acc {
                    if ctx.cluster_use_metadata.is_none() {
                        ctx.cluster_use_metadata = Some(metadata.clone());
                    }
                }
                Ok(acc)
            }
        }
    }
}

/// Expands axes into one argument map per element of their cartesian
/// product. Earlier axes vary slowest. An axis with no values produces no
/// combinations; no axes at all produce the single empty combination.
pub fn cartesian_product_args(axes: &AxisMap) -> Vec<ArgMap> {
    let mut expanded = vec![ArgMap::new()];
    for (name, values) in axes {
        let mut next = Vec::with_capacity(expanded.len() * values.len());
        for base in &expanded {
            for value in values {
                let mut combo = base.clone();
                combo.insert(name.clone(), value.clone());
                next.push(combo);
            }
        }
        expanded = next;
    }
    expanded
}
