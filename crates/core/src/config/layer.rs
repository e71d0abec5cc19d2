use crate::config::{is_missing, Origin, Vars};
use std::collections::BTreeMap;

/// What a source hands back when it has something to say.
#[derive(Debug, Clone)]
pub struct Contribution {
    pub vars: Vars,
    pub origin: Origin,
}

/// One configuration source. `Ok(None)` means "nothing to contribute"; an
/// error means the source failed and its layer is skipped.
pub trait Source: Send + Sync {
    fn name(&self) -> &'static str;

    fn load(&self) -> anyhow::Result<Option<Contribution>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    /// Every contributed entry replaces the current value.
    Override,
    /// Entries only land where the key is missing or empty.
    FillMissing,
}

impl Merge {
    /// Merge `contribution` into the working table. Returns how many entries landed.
    pub fn apply(
        self,
        vars: &mut Vars,
        origins: &mut BTreeMap<String, Origin>,
        contribution: Contribution,
    ) -> usize {
        let mut applied = 0;
        for (key, value) in contribution.vars {
            if self == Merge::FillMissing && !is_missing(vars, &key) {
                continue;
            }
            origins.insert(key.clone(), contribution.origin.clone());
            vars.insert(key, value);
            applied += 1;
        }
        applied
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Always,
    /// Run only while the key is missing or empty.
    WhenMissing(String),
}

impl Condition {
    pub fn holds(&self, vars: &Vars) -> bool {
        match self {
            Condition::Always => true,
            Condition::WhenMissing(key) => is_missing(vars, key),
        }
    }
}

pub struct Layer {
    pub(crate) source: Box<dyn Source>,
    pub(crate) merge: Merge,
    pub(crate) condition: Condition,
}

impl Layer {
    /// Always runs, overriding existing values.
    pub fn new(source: impl Source + 'static) -> Self {
        Self {
            source: Box::new(source),
            merge: Merge::Override,
            condition: Condition::Always,
        }
    }

    pub fn merge(mut self, merge: Merge) -> Self {
        self.merge = merge;
        self
    }

    pub fn when_missing(mut self, key: impl Into<String>) -> Self {
        self.condition = Condition::WhenMissing(key.into());
        self
    }

    pub fn name(&self) -> &'static str {
        self.source.name()
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("source", &self.source.name())
            .field("merge", &self.merge)
            .field("condition", &self.condition)
            .finish()
    }
}
