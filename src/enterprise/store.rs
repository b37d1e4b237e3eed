//! Persistence seam for escrow wallets.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::wallet::{EscrowError, EscrowWalletMetadata};

#[async_trait]
pub trait EscrowStore: Send + Sync {
    async fn insert(&self, wallet: EscrowWalletMetadata) -> Result<(), EscrowError>;
    async fn get(&self, id: Uuid) -> Result<Option<EscrowWalletMetadata>, EscrowError>;
    /// Replaces an existing wallet; unknown ids are an error.
    async fn update(&self, wallet: EscrowWalletMetadata) -> Result<(), EscrowError>;
    async fn len(&self) -> usize;
}

/// Process-local store. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryEscrowStore {
    wallets: RwLock<HashMap<Uuid, EscrowWalletMetadata>>,
}

#[async_trait]
impl EscrowStore for InMemoryEscrowStore {
    async fn insert(&self, wallet: EscrowWalletMetadata) -> Result<(), EscrowError> {
        let mut map = self.wallets.write().await;
        if map.contains_key(&wallet.id) {
            return Err(EscrowError::Storage(format!("duplicate wallet id {}", wallet.id)));
        }
        map.insert(wallet.id, wallet);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<EscrowWalletMetadata>, EscrowError> {
        Ok(self.wallets.read().await.get(&id).cloned())
    }

    async fn update(&self, wallet: EscrowWalletMetadata) -> Result<(), EscrowError> {
        let mut map = self.wallets.write().await;
        match map.get_mut(&wallet.id) {
            Some(slot) => {
                *slot = wallet;
                Ok(())
            }
            None => Err(EscrowError::NotFound(wallet.id)),
        }
    }

    async fn len(&self) -> usize {
        self.wallets.read().await.len()
    }
}
