use std::collections::HashSet;

/// Distinct-member counter; only the cardinality is ever persisted
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UniqueCounter {
    members: HashSet<String>,
}

impl UniqueCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&mut self, value: &str) {
        if !self.members.contains(value) {
            self.members.insert(value.to_string());
        }
    }

    pub fn len(&self) -> i64 {
        self.members.len() as i64
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_distinct_members() {
        let mut counter = UniqueCounter::new();
        counter.count("a");
        counter.count("b");
        counter.count("a");
        assert_eq!(counter.len(), 2);

        counter.clear();
        assert!(counter.is_empty());
    }
}
