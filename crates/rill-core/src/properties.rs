//! Tunable engine properties.

use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineProperty {
    /// Rewrite generic opcodes into type-specialized ones.
    TypedCode,
    /// Require definite assignment on every path, not just one.
    StrictDefiniteAssignment,
    MaxCallDepth,
    /// Nesting limit for on-demand compilation of callees.
    MaxInferenceDepth,
    /// Raise floating point exceptional conditions as script exceptions.
    TrapFloatExceptions,
    /// Allocations between automatic cycle collections; 0 disables them.
    GcThreshold,
}

impl EngineProperty {
    pub fn default_value(&self) -> usize {
        match self {
            EngineProperty::TypedCode => 1,
            EngineProperty::StrictDefiniteAssignment => 0,
            EngineProperty::MaxCallDepth => 10000,
            EngineProperty::MaxInferenceDepth => 64,
            EngineProperty::TrapFloatExceptions => 1,
            EngineProperty::GcThreshold => 0,
        }
    }
}

/// Property values with defaults for anything unset.
#[derive(Debug, Clone, Default)]
pub struct EngineProperties {
    values: FxHashMap<EngineProperty, usize>,
}

impl EngineProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, property: EngineProperty, value: usize) {
        self.values.insert(property, value);
    }

    pub fn get(&self, property: EngineProperty) -> usize {
        self.values
            .get(&property)
            .copied()
            .unwrap_or_else(|| property.default_value())
    }

    pub fn flag(&self, property: EngineProperty) -> bool {
        self.get(property) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_until_set() {
        let mut props = EngineProperties::new();
        assert_eq!(props.get(EngineProperty::MaxCallDepth), 10000);
        assert!(props.flag(EngineProperty::TypedCode));
        props.set(EngineProperty::TypedCode, 0);
        assert!(!props.flag(EngineProperty::TypedCode));
    }
}
