//! Mapping between out-of-band query identifiers and canonical host names
//!
//! A client config names its hosts once (`host_list`) and describes how to
//! reach their management controllers with a pattern such as `%h-ipmi`. Every
//! host is rendered through the pattern; sensor output is later keyed by the
//! rendered identifier and must be translated back to the canonical host.

use log::warn;
use std::collections::BTreeMap;

/// Placeholder replaced by each host name
pub const HOST_PLACEHOLDER: &str = "%h";

/// Identifier → host mapping for one client config
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostMapping {
    by_identifier: BTreeMap<String, String>,
}

impl HostMapping {
    /// Render `pattern` for every host in `hosts`
    ///
    /// Without the placeholder all hosts collapse onto the literal pattern and
    /// the last host wins; that is accepted as a configuration choice.
    pub fn from_template<S: AsRef<str>>(pattern: &str, hosts: &[S]) -> Self {
        let mut by_identifier = BTreeMap::new();
        for host in hosts {
            let host = host.as_ref();
            let identifier = pattern.replace(HOST_PLACEHOLDER, host);
            by_identifier.insert(identifier, host.to_string());
        }

        if !pattern.contains(HOST_PLACEHOLDER) && hosts.len() > 1 {
            warn!(
                "Host pattern '{}' has no {} placeholder, {} hosts share one identifier",
                pattern,
                HOST_PLACEHOLDER,
                hosts.len()
            );
        }

        Self { by_identifier }
    }

    /// Canonical host for a query identifier
    pub fn resolve(&self, identifier: &str) -> Option<&str> {
        self.by_identifier.get(identifier).map(String::as_str)
    }

    /// Number of distinct query identifiers
    pub fn len(&self) -> usize {
        self.by_identifier.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_identifier.is_empty()
    }

    /// Query identifiers in sorted order
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.by_identifier.keys().map(String::as_str)
    }

    /// Comma-joined identifier list as passed to `--host`
    pub fn host_argument(&self) -> String {
        self.identifiers().collect::<Vec<_>>().join(",")
    }
}
