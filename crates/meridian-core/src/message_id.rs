use serde::{Deserialize, Serialize};
use std::fmt;

/// Broker-assigned position of a published message.
///
/// `ledger_id`/`entry_id` identify the stored batch; `batch_index` locates the
/// message inside it and is `None` for messages sent outside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId {
    pub ledger_id: u64,
    pub entry_id: u64,
    pub partition: u32,
    pub batch_index: Option<u32>,
}

impl MessageId {
    pub fn new(ledger_id: u64, entry_id: u64, partition: u32, batch_index: Option<u32>) -> Self {
        Self {
            ledger_id,
            entry_id,
            partition,
            batch_index,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.batch_index {
            Some(idx) => write!(
                f,
                "{}:{}:{}:{}",
                self.ledger_id, self.entry_id, self.partition, idx
            ),
            None => write!(f, "{}:{}:{}", self.ledger_id, self.entry_id, self.partition),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(MessageId::new(3, 14, 1, Some(2)).to_string(), "3:14:1:2");
        assert_eq!(MessageId::new(3, 14, 1, None).to_string(), "3:14:1");
    }

    #[test]
    fn test_ordering_within_batch() {
        let a = MessageId::new(1, 5, 0, Some(0));
        let b = MessageId::new(1, 5, 0, Some(1));
        let c = MessageId::new(1, 6, 0, Some(0));
        assert!(a < b && b < c);
    }
}
