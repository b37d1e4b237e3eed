//! Enterprise escrow wallets.

pub mod store;
pub mod wallet;

pub use store::{EscrowStore, InMemoryEscrowStore};
pub use wallet::{
    AuditAction, AuditEntry, CreateEscrowRequest, Currency, EscrowError, EscrowReport, EscrowStatus,
    EscrowWalletMetadata, EscrowWalletService, ReleaseEscrowRequest, WalletActionRequest,
};
