//! Pairing of source changes with deployed changes.

use std::collections::BTreeMap;

use crate::change::{Change, ChangeKey, ObjectKey};
use crate::error::{DeployError, DeployResult};

/// A source change and a deployed change sharing one [`ChangeKey`].
///
/// At least one side is always present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangePair {
    key: ChangeKey,
    state: PairState,
}

/// Which sides of a pair are present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairState {
    /// New in source.
    SourceOnly(Change),
    /// Removed from source.
    DeployedOnly(Change),
    /// Present on both sides.
    Both { source: Change, deployed: Change },
}

impl ChangePair {
    /// Pair holding only a source change.
    pub fn source_only(change: Change) -> Self {
        Self {
            key: change.key.clone(),
            state: PairState::SourceOnly(change),
        }
    }

    /// Pair holding only a deployed change.
    pub fn deployed_only(change: Change) -> Self {
        Self {
            key: change.key.clone(),
            state: PairState::DeployedOnly(change),
        }
    }

    /// Pair holding both sides; the keys must match.
    pub fn both(source: Change, deployed: Change) -> DeployResult<Self> {
        Self::source_only(source).with_deployed(deployed)
    }

    fn with_source(self, change: Change) -> DeployResult<Self> {
        let state = match self.state {
            PairState::DeployedOnly(deployed) => PairState::Both { source: change, deployed },
            PairState::SourceOnly(existing) | PairState::Both { source: existing, .. } => {
                return Err(duplicate(&self.key, "source", &existing, &change));
            }
        };
        Ok(Self { key: self.key, state })
    }

    fn with_deployed(self, change: Change) -> DeployResult<Self> {
        if change.key != self.key {
            return Err(DeployError::config(format!(
                "Cannot pair deployed change {} with key {}",
                change.key, self.key
            )));
        }
        let state = match self.state {
            PairState::SourceOnly(source) => PairState::Both { source, deployed: change },
            PairState::DeployedOnly(existing) | PairState::Both { deployed: existing, .. } => {
                return Err(duplicate(&self.key, "deployed", &existing, &change));
            }
        };
        Ok(Self { key: self.key, state })
    }

    /// Key shared by both sides of the pair.
    pub fn key(&self) -> &ChangeKey {
        &self.key
    }

    /// Identity of the paired object.
    pub fn object_key(&self) -> &ObjectKey {
        &self.key.object_key
    }

    /// The source side, if present.
    pub fn source(&self) -> Option<&Change> {
        match &self.state {
            PairState::SourceOnly(source) | PairState::Both { source, .. } => Some(source),
            PairState::DeployedOnly(_) => None,
        }
    }

    /// The deployed side, if present.
    pub fn deployed(&self) -> Option<&Change> {
        match &self.state {
            PairState::DeployedOnly(deployed) | PairState::Both { deployed, .. } => Some(deployed),
            PairState::SourceOnly(_) => None,
        }
    }

    /// The source change if present, else the deployed one.
    pub fn source_or_deployed(&self) -> &Change {
        match &self.state {
            PairState::SourceOnly(change) | PairState::Both { source: change, .. } | PairState::DeployedOnly(change) => change,
        }
    }

    /// Consume the pair, returning its sides.
    pub fn into_state(self) -> PairState {
        self.state
    }
}

fn duplicate(key: &ChangeKey, side: &'static str, first: &Change, second: &Change) -> DeployError {
    DeployError::DuplicateChangeKey {
        key: key.clone(),
        side,
        first: describe(first),
        second: describe(second),
    }
}

fn describe(change: &Change) -> String {
    match &change.file_location {
        Some(path) => format!("{} from {}", change.display_string(), path.display()),
        None => change.display_string(),
    }
}

/// Builds [`ChangePair`]s keyed by [`ChangeKey`].
#[derive(Debug, Default)]
pub struct ChangePairs {
    pairs: BTreeMap<ChangeKey, ChangePair>,
}

impl ChangePairs {
    /// Empty pairing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair every deployed and source change by key.
    ///
    /// Fails if two source changes, or two deployed changes, share a key.
    pub fn build(
        deployed: impl IntoIterator<Item = Change>,
        source: impl IntoIterator<Item = Change>,
    ) -> DeployResult<Vec<ChangePair>> {
        let mut builder = Self::new();
        for change in deployed {
            builder.add_deployed(change)?;
        }
        for change in source {
            builder.add_source(change)?;
        }
        Ok(builder.finish())
    }

    /// Add a source change; a second source for one key is an error.
    pub fn add_source(&mut self, change: Change) -> DeployResult<()> {
        let pair = match self.pairs.remove(&change.key) {
            Some(pair) => pair.with_source(change)?,
            None => ChangePair::source_only(change),
        };
        self.pairs.insert(pair.key.clone(), pair);
        Ok(())
    }

    /// Add a deployed change; a second deployed change for one key is an error.
    pub fn add_deployed(&mut self, change: Change) -> DeployResult<()> {
        let pair = match self.pairs.remove(&change.key) {
            Some(pair) => pair.with_deployed(change)?,
            None => ChangePair::deployed_only(change),
        };
        self.pairs.insert(pair.key.clone(), pair);
        Ok(())
    }

    /// Pairs ordered by key.
    pub fn finish(self) -> Vec<ChangePair> {
        self.pairs.into_values().collect()
    }
}
