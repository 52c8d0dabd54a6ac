//! Expansion of a marked test function into concrete test contexts.

use std::collections::HashSet;

use super::{Mark, MarkError};
use crate::test::context::{ArgMap, TestContext};

/// Expands a marked function into the list of test contexts the runner
/// will schedule.
///
/// The seed context identifies the function; the marks are applied to it
/// in order (innermost annotation first). When the caller supplies
/// explicit injected arguments — a command-line override — all
/// parametrizing marks are stripped and replaced with a single
/// parametrize mark carrying exactly those arguments.
pub struct MarkedFunctionExpander {
    seed: TestContext,
    marks: Vec<Mark>,
}

impl MarkedFunctionExpander {
    pub fn new(seed: TestContext, marks: &[Mark]) -> Self {
        Self {
            seed,
            marks: marks.to_vec(),
        }
    }

    /// Runs the expansion, optionally overriding parametrization with
    /// explicit arguments.
    ///
    /// Contexts that expand to the same test id are collapsed, first one
    /// wins.
    pub fn expand(self, injected_args: Option<ArgMap>) -> Result<Vec<TestContext>, MarkError> {
        let mut marks = self.marks;
        if let Some(args) = injected_args {
            marks.retain(|m| !m.is_parametrizing());
            marks.push(Mark::Parametrize(args));
        }

        let mut context_list = if marks.iter().any(Mark::is_parametrizing) {
            Vec::new()
        } else {
            vec![self.seed.clone()]
        };

        for mark in &marks {
            context_list = mark.apply(&self.seed, context_list)?;
        }

        let mut seen = HashSet::new();
        context_list.retain(|ctx| seen.insert(ctx.test_id()));
        Ok(context_list)
    }
}
