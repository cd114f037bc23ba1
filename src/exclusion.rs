use std::collections::HashSet;

/// Immutable set of names that must never be emitted or visited
///
/// Built once from configuration lists (metric names, filesystem mount
/// points). Membership is the only operation; the canonical vocabulary of a
/// unit is never changed by it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet {
    names: HashSet<String>,
}

impl ExclusionSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Union of a global list and a per-client list
    pub fn union<'a, G, C>(global: G, client: C) -> Self
    where
        G: IntoIterator<Item = &'a String>,
        C: IntoIterator<Item = &'a String>,
    {
        Self::new(global.into_iter().chain(client).cloned())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }
}
