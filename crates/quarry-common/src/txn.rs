//! Transaction handle.

/// Sentinel transaction id.
pub const INVALID_TXN_ID: i64 = -1;

/// Placeholder transaction handle threaded through index operations.
///
/// The storage core performs no locking, logging, or recovery; the handle
/// exists so index entry points keep a stable signature once a concurrency
/// layer is added on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    txn_id: i64,
}

impl Transaction {
    /// Creates a transaction handle with the given id.
    pub fn new(txn_id: i64) -> Self {
        Self { txn_id }
    }

    /// Returns the transaction id.
    pub fn id(&self) -> i64 {
        self.txn_id
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new(INVALID_TXN_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id() {
        let txn = Transaction::new(7);
        assert_eq!(txn.id(), 7);
    }

    #[test]
    fn test_transaction_default_is_invalid() {
        assert_eq!(Transaction::default().id(), INVALID_TXN_ID);
    }
}
