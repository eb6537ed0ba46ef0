/// A single store mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Adds members to a set.
    SetAdd { key: String, members: Vec<String> },
    /// Adds `amount` to the score of `member` in a sorted set.
    IncrementBy {
        key: String,
        member: String,
        amount: u64,
    },
    /// Sets a plain string value.
    SetValue { key: String, value: String },
}

/// Mutations for one file, submitted to the store as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn set_add(&mut self, key: impl Into<String>, members: Vec<String>) {
        if !members.is_empty() {
            self.push(WriteOp::SetAdd {
                key: key.into(),
                members,
            });
        }
    }

    pub fn increment_by(&mut self, key: impl Into<String>, member: impl Into<String>, amount: u64) {
        self.push(WriteOp::IncrementBy {
            key: key.into(),
            member: member.into(),
            amount,
        });
    }

    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.push(WriteOp::SetValue {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of histogram increments in the batch.
    pub fn increments(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, WriteOp::IncrementBy { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_set_add_is_dropped() {
        let mut batch = WriteBatch::new();
        batch.set_add("DAYS", Vec::new());
        assert!(batch.is_empty());
    }

    #[test]
    fn test_increment_count() {
        let mut batch = WriteBatch::new();
        batch.set_add("DAYS", vec!["20240101".to_string()]);
        batch.increment_by("s:20240101:dport", "80", 3);
        batch.set_value("AR_13_10.0.0.1", "4");
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.increments(), 1);
    }
}
