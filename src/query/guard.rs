use crate::error::{Result, SyncdexError};
use crate::store::PartitionedStore;
use std::sync::Arc;

/// Refuses to run queries from inside a store transaction.
///
/// The index is not transactional, so a query inside a transaction could
/// not see the transaction's own uncommitted writes. The transaction is left
/// untouched; the caller decides whether to commit or roll back.
#[derive(Clone)]
pub struct TransactionGuard {
    store: Arc<dyn PartitionedStore>,
}

impl TransactionGuard {
    pub fn new(store: Arc<dyn PartitionedStore>) -> Self {
        TransactionGuard { store }
    }

    pub fn check(&self, store_name: &str) -> Result<()> {
        if self.store.supports_transactions(store_name) && self.store.transaction_active(store_name)
        {
            tracing::warn!(
                "[GUARD] rejected query on store {} inside an open transaction",
                store_name
            );
            return Err(SyncdexError::QueryWithinTransaction);
        }
        Ok(())
    }
}
