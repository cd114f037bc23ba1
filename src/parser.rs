//! Totals-row parsing for filesystem client statistics
//!
//! `beegfs-ctl --clientstats` prints one row per client followed by an
//! aggregate row:
//!
//! ```text
//! Sum:          27 [sum]          10 [ack]          5 [close] ...
//! ```
//!
//! Only the aggregate row is of interest. Its payload is flattened into
//! alternating `value label` tokens which update a [`MatchTable`].

use crate::exclusion::ExclusionSet;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Selects the aggregate row: `Sum:` followed by a leading `<count> [<label>]`
static TOTALS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Sum:\s+\d+\s+\[[a-zA-Z]+\]+").unwrap());

/// Splits a row into its name and the numeric payload starting at the first digit
static STATS_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(.*?)\s+?(\d.*?)$").unwrap());

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static BRACKETS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\[\]]").unwrap());

/// Label of the synthetic accumulator for unknown operations
pub const OTHER_LABEL: &str = "other";

/// Whether `line` is the aggregate row
pub fn is_totals_line(line: &str) -> bool {
    TOTALS_LINE.is_match(line)
}

/// Flatten the payload of a row into `(value, label)` pairs
///
/// Returns `None` when the row carries no numeric payload. A trailing value
/// without a label is dropped.
pub fn payload_pairs(line: &str) -> Option<Vec<(String, String)>> {
    let captures = STATS_LINE.captures(line)?;
    let payload = captures.get(2)?.as_str();

    let unbracketed = BRACKETS.replace_all(payload, " ");
    let collapsed = WHITESPACE.replace_all(&unbracketed, " ");
    let tokens: Vec<&str> = collapsed.trim().split(' ').collect();

    Some(
        tokens
            .chunks_exact(2)
            .map(|pair| (pair[0].to_string(), pair[1].to_string()))
            .collect(),
    )
}

/// What happened to the pairs of one aggregate row
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LineOutcome {
    /// Pairs written to a known key
    pub matched: usize,
    /// Pairs added to the `other` accumulator
    pub accumulated: usize,
    /// Pairs dropped because the value was not a number
    pub invalid: usize,
}

/// Canonical metric key → last observed value
///
/// Seeded once with every non-excluded label of a fixed vocabulary, all at
/// zero, plus the `other` accumulator. Parsing never adds keys.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchTable {
    prefix: String,
    values: BTreeMap<String, f64>,
}

impl MatchTable {
    /// Build the table for `vocabulary`, skipping excluded names
    ///
    /// A label is excluded when either its raw form (`ack`) or its canonical
    /// form (`beegfs_cstorage_ack`) is in `excluded`. The same applies to
    /// `other`.
    pub fn new(prefix: &str, vocabulary: &[&str], excluded: &ExclusionSet) -> Self {
        let mut values = BTreeMap::new();
        for label in vocabulary.iter().copied().chain([OTHER_LABEL]) {
            let key = format!("{}{}", prefix, label);
            if excluded.contains(label) || excluded.contains(&key) {
                continue;
            }
            values.insert(key, 0.0);
        }

        Self {
            prefix: prefix.to_string(),
            values,
        }
    }

    fn key_for(&self, label: &str) -> String {
        format!("{}{}", self.prefix, label)
    }

    /// Current value of a raw label
    pub fn get(&self, label: &str) -> Option<f64> {
        self.values.get(&self.key_for(label)).copied()
    }

    pub fn contains_label(&self, label: &str) -> bool {
        label != OTHER_LABEL && self.values.contains_key(&self.key_for(label))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Every key with its current value, in key order
    pub fn snapshot(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Apply the pairs of one aggregate row
    ///
    /// Known labels are overwritten. Unknown labels add their value to
    /// `other`, except for the leading pair, which is the row total already
    /// matched by the row selector: it is kept only under a known label.
    /// `on_invalid` receives every value that failed to parse.
    pub fn apply_pairs<F>(&mut self, pairs: &[(String, String)], mut on_invalid: F) -> LineOutcome
    where
        F: FnMut(&str, &str),
    {
        let mut outcome = LineOutcome::default();
        let other_key = self.key_for(OTHER_LABEL);

        for (index, (raw_value, label)) in pairs.iter().enumerate() {
            let value: f64 = match raw_value.parse() {
                Ok(v) => v,
                Err(_) => {
                    on_invalid(raw_value, label);
                    outcome.invalid += 1;
                    continue;
                }
            };

            if self.contains_label(label) {
                let key = self.key_for(label);
                self.values.insert(key, value);
                outcome.matched += 1;
            } else if index == 0 {
                continue;
            } else if let Some(other) = self.values.get_mut(&other_key) {
                *other += value;
                outcome.accumulated += 1;
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(vocabulary: &[&str]) -> MatchTable {
        MatchTable::new("", vocabulary, &ExclusionSet::default())
    }

    fn apply(table: &mut MatchTable, line: &str) -> LineOutcome {
        let pairs = payload_pairs(line).unwrap();
        table.apply_pairs(&pairs, |_, _| {})
    }

    #[test]
    fn test_totals_line_selection() {
        assert!(is_totals_line("Sum:          27 [sum]          10 [ack]"));
        assert!(is_totals_line("Sum: 42 [x] 10 ack 5 sum"));
        assert!(!is_totals_line("192.168.0.1   27 [sum]   10 [ack]"));
        assert!(!is_totals_line("Sum:"));
        assert!(!is_totals_line("  Sum: 27 [sum]"));
        assert!(!is_totals_line(""));
    }

    #[test]
    fn test_payload_pairs_strip_brackets() {
        let pairs = payload_pairs("Sum:     27 [sum]     10 [ack]   3 [MiB-rd/s]").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("27".to_string(), "sum".to_string()),
                ("10".to_string(), "ack".to_string()),
                ("3".to_string(), "MiB-rd/s".to_string()),
            ]
        );
    }

    #[test]
    fn test_payload_pairs_drops_dangling_value() {
        let pairs = payload_pairs("Sum: 1 [sum] 2 [ack] 7").unwrap();
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn test_unknown_labels_accumulate_into_other() {
        let mut t = table(&["ack", "sum"]);
        let outcome = apply(&mut t, "Sum: 1 [x] 5 foo 3 bar");

        assert_eq!(t.get(OTHER_LABEL), Some(8.0));
        assert_eq!(outcome.accumulated, 2);
        assert_eq!(outcome.matched, 0);
    }

    #[test]
    fn test_known_labels_are_overwritten() {
        let mut t = table(&["ack", "sum"]);
        apply(&mut t, "Sum: 42 [x] 10 ack 5 sum");

        assert_eq!(t.get("ack"), Some(10.0));
        assert_eq!(t.get("sum"), Some(5.0));
        assert_eq!(t.get(OTHER_LABEL), Some(0.0));
    }

    #[test]
    fn test_last_write_wins_across_lines() {
        let mut t = table(&["ack"]);
        apply(&mut t, "Sum: 1 [sum] 10 [ack]");
        apply(&mut t, "Sum: 1 [sum] 4 [ack]");
        assert_eq!(t.get("ack"), Some(4.0));
    }

    #[test]
    fn test_leading_known_label_is_recorded() {
        let mut t = table(&["sum", "ack"]);
        apply(&mut t, "Sum:   27 [sum]   10 [ack]");
        assert_eq!(t.get("sum"), Some(27.0));
        assert_eq!(t.get("ack"), Some(10.0));
    }

    #[test]
    fn test_invalid_value_skips_only_that_pair() {
        let mut t = table(&["ack"]);
        let mut invalid = Vec::new();
        let pairs = vec![
            ("1".to_string(), "sum".to_string()),
            ("1.2.3".to_string(), "foo".to_string()),
            ("4".to_string(), "ack".to_string()),
            ("2".to_string(), "bar".to_string()),
        ];
        let outcome = t.apply_pairs(&pairs, |v, l| invalid.push(format!("{} {}", v, l)));

        assert_eq!(invalid, vec!["1.2.3 foo"]);
        assert_eq!(outcome.invalid, 1);
        assert_eq!(t.get("ack"), Some(4.0));
        assert_eq!(t.get(OTHER_LABEL), Some(2.0));
    }

    #[test]
    fn test_excluded_labels_are_not_seeded() {
        let excluded = ExclusionSet::new(["ack", "beegfs_cstorage_close"]);
        let t = MatchTable::new("beegfs_cstorage_", &["ack", "close", "sum"], &excluded);

        let keys: Vec<&str> = t.snapshot().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["beegfs_cstorage_other", "beegfs_cstorage_sum"]);
        assert!(!t.contains_label("ack"));
    }

    #[test]
    fn test_excluded_label_in_output_counts_as_other() {
        let excluded = ExclusionSet::new(["ack"]);
        let mut t = MatchTable::new("", &["ack", "sum"], &excluded);
        apply(&mut t, "Sum: 1 [sum] 6 [ack]");

        assert_eq!(t.get("ack"), None);
        assert_eq!(t.get(OTHER_LABEL), Some(6.0));
    }

    #[test]
    fn test_excluding_other_drops_unknown_values() {
        let excluded = ExclusionSet::new([OTHER_LABEL]);
        let mut t = MatchTable::new("", &["ack"], &excluded);
        let outcome = apply(&mut t, "Sum: 1 [sum] 6 [foo]");

        assert_eq!(t.len(), 1);
        assert_eq!(outcome.accumulated, 0);
    }

    #[test]
    fn test_parsing_never_adds_keys() {
        let mut t = table(&["ack"]);
        let before = t.len();
        apply(&mut t, "Sum: 1 [new] 2 [fresh] 3 [keys]");
        assert_eq!(t.len(), before);
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    // Unknown labels after the leading pair add exactly their sum to `other`
    #[quickcheck]
    fn prop_other_accumulates_exact_sum(values: Vec<u16>) -> bool {
        let mut table = MatchTable::new("", &["ack"], &ExclusionSet::default());
        let mut line = String::from("Sum: 1 [total]");
        for (i, v) in values.iter().enumerate() {
            line.push_str(&format!(" {} [unknown{}]", v, i));
        }

        let pairs = payload_pairs(&line).unwrap();
        table.apply_pairs(&pairs, |_, _| {});

        let expected: f64 = values.iter().map(|v| f64::from(*v)).sum();
        table.get(OTHER_LABEL) == Some(expected)
    }

    // The key set is fixed at construction no matter what is parsed
    #[quickcheck]
    fn prop_key_set_is_stable(labels: Vec<String>) -> bool {
        let mut table = MatchTable::new("p_", &["ack", "sum"], &ExclusionSet::default());
        let pairs: Vec<(String, String)> =
            labels.into_iter().map(|l| ("1".to_string(), l)).collect();
        table.apply_pairs(&pairs, |_, _| {});
        table.len() == 3
    }
}
