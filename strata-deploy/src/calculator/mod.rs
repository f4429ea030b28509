//! Per change-type classification of change pairs into commands.

mod incremental;
mod rerunnable;

pub use incremental::IncrementalCalculator;
pub use rerunnable::{GroupedCalculator, RerunnableCalculator};

use crate::change::{CalculatorStrategy, Change, ChangeType};
use crate::command::ChangeCommand;
use crate::error::DeployResult;
use crate::graph::GraphEnricher;
use crate::pair::ChangePair;

/// Dispatches change pairs to the calculator for their change type's strategy.
#[derive(Debug, Clone)]
pub struct ChangeTypeCalculator {
    incremental: IncrementalCalculator,
    rerunnable: RerunnableCalculator,
    grouped: GroupedCalculator,
}

impl ChangeTypeCalculator {
    /// Create the calculators; `parallel_threads` is the hint given to parallel deploys.
    pub fn new(enricher: GraphEnricher, parallel_threads: usize) -> Self {
        Self {
            incremental: IncrementalCalculator::new(parallel_threads),
            rerunnable: RerunnableCalculator::new(enricher.clone()),
            grouped: GroupedCalculator::new(enricher),
        }
    }

    /// Classify the pairs of one change type.
    pub fn calculate(
        &self,
        change_type: &ChangeType,
        pairs: Vec<ChangePair>,
        all_sources: &[Change],
        rollback: bool,
        init_allowed: bool,
    ) -> DeployResult<Vec<ChangeCommand>> {
        match change_type.strategy {
            CalculatorStrategy::Incremental => self.incremental.calculate(pairs, rollback, init_allowed),
            CalculatorStrategy::Rerunnable => self.rerunnable.calculate(change_type, pairs, all_sources),
            CalculatorStrategy::Grouped => self.grouped.calculate(pairs),
        }
    }
}
