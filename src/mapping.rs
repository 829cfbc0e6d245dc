//! Detection label → activity id mapping.

use std::collections::BTreeMap;

/// Maps AI bounding-box labels to one or more catalog activity ids.
///
/// A single label may expand to several activities: an employee in frame can
/// be doing any of the employee activities, so `person-employee` yields a
/// detection for each of them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelMapper {
    table: BTreeMap<String, Vec<i64>>,
}

impl Default for LabelMapper {
    fn default() -> Self {
        let mut table = BTreeMap::new();
        // Sales desk, stretching, cleaning, making calls.
        table.insert("person-employee".to_string(), vec![1, 2, 3, 4]);
        // Intake.
        table.insert("person-customer".to_string(), vec![5]);
        table.insert("stretching".to_string(), vec![2]);
        Self { table }
    }
}

impl LabelMapper {
    /// A mapper with no labels at all.
    pub fn empty() -> Self {
        Self {
            table: BTreeMap::new(),
        }
    }

    pub fn with_overrides<I, S>(overrides: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<i64>)>,
        S: Into<String>,
    {
        let mut mapper = Self::default();
        mapper.merge_overrides(overrides);
        mapper
    }

    /// Activity ids for `label`, empty when the label is unknown.
    ///
    /// Matching is exact: labels are produced by the detector vocabulary, not
    /// typed by people.
    pub fn resolve(&self, label: &str) -> &[i64] {
        self.table.get(label).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Merges caller-supplied entries. A later entry for the same label
    /// replaces the earlier one.
    pub fn merge_overrides<I, S>(&mut self, overrides: I)
    where
        I: IntoIterator<Item = (S, Vec<i64>)>,
        S: Into<String>,
    {
        for (label, ids) in overrides {
            let mut unique = Vec::with_capacity(ids.len());
            for id in ids {
                if !unique.contains(&id) {
                    unique.push(id);
                }
            }
            self.table.insert(label.into(), unique);
        }
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table() {
        let mapper = LabelMapper::default();
        assert_eq!(mapper.resolve("person-employee"), &[1, 2, 3, 4]);
        assert_eq!(mapper.resolve("person-customer"), &[5]);
        assert_eq!(mapper.resolve("stretching"), &[2]);
        assert_eq!(mapper.len(), 3);
    }

    #[test]
    fn unknown_label_resolves_to_nothing() {
        let mapper = LabelMapper::default();
        assert!(mapper.resolve("forklift").is_empty());
        assert!(mapper.resolve("").is_empty());
        assert!(mapper.resolve("Person-Employee").is_empty());
    }

    #[test]
    fn overrides_replace_and_extend() {
        let mut mapper = LabelMapper::default();
        mapper.merge_overrides(vec![
            ("stretching", vec![7]),
            ("mopping", vec![3, 3, 6]),
            ("stretching", vec![8, 2]),
        ]);
        assert_eq!(mapper.resolve("stretching"), &[8, 2]);
        assert_eq!(mapper.resolve("mopping"), &[3, 6]);
        assert_eq!(mapper.resolve("person-customer"), &[5]);
    }

    #[test]
    fn empty_mapper_has_no_labels() {
        let mapper = LabelMapper::empty();
        assert!(mapper.is_empty());
        assert_eq!(mapper.labels().count(), 0);
    }
}
