//! # Escrow wallets
//! Metadata and lifecycle for enterprise escrow arrangements:
//! `active → locked → released`, with `disputed` reachable from either open state.
//!
//! The multisig address is a deterministic placeholder; no on-chain account is
//! created. Every state change appends to the wallet's audit trail.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::store::EscrowStore;
use crate::config::EscrowConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Sol,
    Usdc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscrowStatus {
    Active,
    Locked,
    Released,
    Disputed,
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EscrowStatus::Active => "active",
            EscrowStatus::Locked => "locked",
            EscrowStatus::Released => "released",
            EscrowStatus::Disputed => "disputed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    Locked,
    Released,
    Disputed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub action: AuditAction,
    pub actor: String,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowWalletMetadata {
    pub id: Uuid,
    pub client_id: String,
    pub multisig_address: String,
    pub signatories: Vec<String>,
    pub required_signatures: u32,
    pub contract_value: Decimal,
    pub currency: Currency,
    pub status: EscrowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub audit_trail: Vec<AuditEntry>,
}

impl EscrowWalletMetadata {
    fn record(&mut self, action: AuditAction, actor: &str, details: impl Into<String>) {
        let now = Utc::now();
        self.audit_trail.push(AuditEntry {
            at: now,
            action,
            actor: actor.to_string(),
            details: details.into(),
        });
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEscrowRequest {
    pub client_id: String,
    pub signatories: Vec<String>,
    pub required_signatures: u32,
    pub contract_value: Decimal,
    pub currency: Currency,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseEscrowRequest {
    pub wallet_id: Uuid,
    pub approvals: Vec<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Body for lock / dispute.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletActionRequest {
    pub wallet_id: Uuid,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EscrowError {
    #[error("validation failed: {}", format_fields(.0))]
    Validation(Vec<FieldError>),
    #[error("wallet {0} not found")]
    NotFound(Uuid),
    #[error("cannot {action} a wallet in status {from}")]
    InvalidTransition {
        from: EscrowStatus,
        action: &'static str,
    },
    #[error("{have} distinct approvals, {need} required")]
    InsufficientSignatures { have: usize, need: u32 },
    #[error("'{0}' is not a signatory of this wallet")]
    UnknownSignatory(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

fn format_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(|f| format!("{}: {}", f.field, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowReport {
    pub wallet_id: Uuid,
    pub client_id: String,
    pub status: EscrowStatus,
    pub contract_value: Decimal,
    pub currency: Currency,
    pub signatory_count: usize,
    pub required_signatures: u32,
    pub audit_entries: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub timeline: Vec<AuditEntry>,
}

/// Identity of the service signer. Only a hash prefix of the secret is kept.
#[derive(Debug, Clone)]
pub struct ServiceKey {
    key_id: String,
    ephemeral: bool,
}

impl ServiceKey {
    pub fn from_secret(secret: Option<&str>) -> Self {
        match secret {
            Some(s) => Self {
                key_id: short_hex(&Sha256::digest(s.as_bytes()), 8),
                ephemeral: false,
            },
            None => {
                let bytes: [u8; 32] = rand::random();
                let key = Self {
                    key_id: short_hex(&Sha256::digest(bytes), 8),
                    ephemeral: true,
                };
                warn!(
                    target: "escrow",
                    key_id = %key.key_id,
                    "SERVICE_PRIVATE_KEY not set; generated an ephemeral service key"
                );
                key
            }
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }
}

fn short_hex(bytes: &[u8], n: usize) -> String {
    hex::encode(&bytes[..n.min(bytes.len())])
}

/// Collects every field problem instead of stopping at the first.
pub fn validate_create(req: &CreateEscrowRequest, cfg: &EscrowConfig) -> Result<(), EscrowError> {
    let mut errs = Vec::new();

    if req.client_id.trim().is_empty() {
        errs.push(FieldError {
            field: "clientId",
            message: "must not be empty".into(),
        });
    }
    if req.contract_value < cfg.min_contract_value {
        errs.push(FieldError {
            field: "contractValue",
            message: format!("must be at least {}", cfg.min_contract_value),
        });
    }

    let trimmed: Vec<&str> = req.signatories.iter().map(|s| s.trim()).collect();
    let distinct: BTreeSet<&str> = trimmed.iter().copied().collect();
    if trimmed.iter().any(|s| s.is_empty()) {
        errs.push(FieldError {
            field: "signatories",
            message: "must not contain empty addresses".into(),
        });
    }
    if distinct.len() != trimmed.len() {
        errs.push(FieldError {
            field: "signatories",
            message: "must be distinct".into(),
        });
    }
    if trimmed.len() < 2 || trimmed.len() > cfg.max_signatories {
        errs.push(FieldError {
            field: "signatories",
            message: format!("must list 2..={} addresses", cfg.max_signatories),
        });
    }
    if req.required_signatures == 0 || (req.required_signatures as usize) > trimmed.len() {
        errs.push(FieldError {
            field: "requiredSignatures",
            message: "must be between 1 and the number of signatories".into(),
        });
    }

    if errs.is_empty() {
        Ok(())
    } else {
        Err(EscrowError::Validation(errs))
    }
}

pub struct EscrowWalletService {
    store: Arc<dyn EscrowStore>,
    key: ServiceKey,
    cfg: EscrowConfig,
    // Serializes read-modify-write cycles on the store.
    write_lock: Mutex<()>,
}

impl EscrowWalletService {
    pub fn new(store: Arc<dyn EscrowStore>, cfg: &EscrowConfig) -> Self {
        let key = ServiceKey::from_secret(cfg.service_private_key.as_deref());
        info!(
            target: "escrow",
            rpc_url = %cfg.rpc_url,
            key_id = %key.key_id(),
            ephemeral = key.is_ephemeral(),
            "escrow wallet service ready"
        );
        Self {
            store,
            key,
            cfg: cfg.clone(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn rpc_url(&self) -> &str {
        &self.cfg.rpc_url
    }

    pub fn service_key(&self) -> &ServiceKey {
        &self.key
    }

    pub async fn wallet_count(&self) -> usize {
        self.store.len().await
    }

    pub async fn create_escrow(
        &self,
        req: &CreateEscrowRequest,
        actor: &str,
    ) -> Result<EscrowWalletMetadata, EscrowError> {
        validate_create(req, &self.cfg)?;

        let signatories: Vec<String> =
            req.signatories.iter().map(|s| s.trim().to_string()).collect();
        let client_id = req.client_id.trim();
        let now = Utc::now();
        let mut wallet = EscrowWalletMetadata {
            id: Uuid::new_v4(),
            client_id: client_id.to_string(),
            multisig_address: self.placeholder_address(
                client_id,
                &signatories,
                req.required_signatures,
            ),
            signatories,
            required_signatures: req.required_signatures,
            contract_value: req.contract_value,
            currency: req.currency,
            status: EscrowStatus::Active,
            created_at: now,
            updated_at: now,
            audit_trail: Vec::new(),
        };
        wallet.record(
            AuditAction::Created,
            actor,
            format!(
                "{}-of-{} escrow for {} {:?}",
                wallet.required_signatures,
                wallet.signatories.len(),
                wallet.contract_value,
                wallet.currency
            ),
        );

        self.store.insert(wallet.clone()).await?;
        counter!("escrow_operations_total", "op" => "create").increment(1);
        info!(
            target: "escrow",
            wallet_id = %wallet.id,
            client = %wallet.client_id,
            "escrow created"
        );
        Ok(wallet)
    }

    pub async fn get_wallet(&self, id: Uuid) -> Result<EscrowWalletMetadata, EscrowError> {
        self.store.get(id).await?.ok_or(EscrowError::NotFound(id))
    }

    pub async fn release_escrow(
        &self,
        req: &ReleaseEscrowRequest,
        actor: &str,
    ) -> Result<EscrowWalletMetadata, EscrowError> {
        let _guard = self.write_lock.lock().await;
        let mut wallet = self.get_wallet(req.wallet_id).await?;
        if !matches!(wallet.status, EscrowStatus::Active | EscrowStatus::Locked) {
            return Err(EscrowError::InvalidTransition {
                from: wallet.status,
                action: "release",
            });
        }

        let mut approvals = BTreeSet::new();
        for a in &req.approvals {
            let a = a.trim();
            if !wallet.signatories.iter().any(|s| s == a) {
                return Err(EscrowError::UnknownSignatory(a.to_string()));
            }
            approvals.insert(a);
        }
        if approvals.len() < wallet.required_signatures as usize {
            return Err(EscrowError::InsufficientSignatures {
                have: approvals.len(),
                need: wallet.required_signatures,
            });
        }

        let details = format!(
            "released with {} approvals{}",
            approvals.len(),
            req.reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
        );
        wallet.status = EscrowStatus::Released;
        wallet.record(AuditAction::Released, actor, details);
        self.store.update(wallet.clone()).await?;

        counter!("escrow_operations_total", "op" => "release").increment(1);
        info!(target: "escrow", wallet_id = %wallet.id, "escrow released");
        Ok(wallet)
    }

    pub async fn lock_escrow(
        &self,
        req: &WalletActionRequest,
        actor: &str,
    ) -> Result<EscrowWalletMetadata, EscrowError> {
        self.transition(
            req,
            actor,
            "lock",
            &[EscrowStatus::Active],
            EscrowStatus::Locked,
            AuditAction::Locked,
        )
        .await
    }

    pub async fn dispute_escrow(
        &self,
        req: &WalletActionRequest,
        actor: &str,
    ) -> Result<EscrowWalletMetadata, EscrowError> {
        self.transition(
            req,
            actor,
            "dispute",
            &[EscrowStatus::Active, EscrowStatus::Locked],
            EscrowStatus::Disputed,
            AuditAction::Disputed,
        )
        .await
    }

    async fn transition(
        &self,
        req: &WalletActionRequest,
        actor: &str,
        action: &'static str,
        allowed_from: &[EscrowStatus],
        to: EscrowStatus,
        audit: AuditAction,
    ) -> Result<EscrowWalletMetadata, EscrowError> {
        let _guard = self.write_lock.lock().await;
        let mut wallet = self.get_wallet(req.wallet_id).await?;
        if !allowed_from.contains(&wallet.status) {
            return Err(EscrowError::InvalidTransition {
                from: wallet.status,
                action,
            });
        }
        wallet.status = to;
        wallet.record(audit, actor, req.reason.clone().unwrap_or_default());
        self.store.update(wallet.clone()).await?;

        counter!("escrow_operations_total", "op" => action).increment(1);
        info!(target: "escrow", wallet_id = %wallet.id, status = %to, "escrow status changed");
        Ok(wallet)
    }

    pub async fn report(&self, id: Uuid) -> Result<EscrowReport, EscrowError> {
        let w = self.get_wallet(id).await?;
        Ok(EscrowReport {
            wallet_id: w.id,
            client_id: w.client_id,
            status: w.status,
            contract_value: w.contract_value,
            currency: w.currency,
            signatory_count: w.signatories.len(),
            required_signatures: w.required_signatures,
            audit_entries: w.audit_trail.len(),
            created_at: w.created_at,
            last_activity: w.updated_at,
            timeline: w.audit_trail,
        })
    }

    fn placeholder_address(
        &self,
        client_id: &str,
        signatories: &[String],
        required: u32,
    ) -> String {
        let nonce: [u8; 16] = rand::random();
        let mut sorted: Vec<&str> = signatories.iter().map(String::as_str).collect();
        sorted.sort_unstable();

        let mut h = Sha256::new();
        h.update(client_id.as_bytes());
        for s in sorted {
            h.update(b"|");
            h.update(s.as_bytes());
        }
        h.update(required.to_le_bytes());
        h.update(self.key.key_id().as_bytes());
        h.update(nonce);
        short_hex(&h.finalize(), 32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enterprise::store::InMemoryEscrowStore;

    fn service() -> EscrowWalletService {
        let cfg = EscrowConfig {
            service_private_key: Some("test-secret".into()),
            ..EscrowConfig::default()
        };
        EscrowWalletService::new(Arc::new(InMemoryEscrowStore::default()), &cfg)
    }

    fn create_req(value: i64) -> CreateEscrowRequest {
        CreateEscrowRequest {
            client_id: "acme".into(),
            signatories: vec!["alice".into(), "bob".into(), "carol".into()],
            required_signatures: 2,
            contract_value: Decimal::from(value),
            currency: Currency::Usdc,
        }
    }

    #[test]
    fn validation_collects_all_problems() {
        let cfg = EscrowConfig::default();
        let req = CreateEscrowRequest {
            client_id: " ".into(),
            signatories: vec!["a".into(), "a".into()],
            required_signatures: 3,
            contract_value: Decimal::from(199_999),
            currency: Currency::Sol,
        };
        let Err(EscrowError::Validation(fields)) = validate_create(&req, &cfg) else {
            panic!("expected validation error");
        };
        let names: Vec<_> = fields.iter().map(|f| f.field).collect();
        assert!(names.contains(&"clientId"));
        assert!(names.contains(&"contractValue"));
        assert!(names.contains(&"signatories"));
        assert!(names.contains(&"requiredSignatures"));
    }

    #[test]
    fn service_key_is_stable_for_a_secret() {
        let a = ServiceKey::from_secret(Some("s"));
        let b = ServiceKey::from_secret(Some("s"));
        assert_eq!(a.key_id(), b.key_id());
        assert_eq!(a.key_id().len(), 16);
        assert!(!a.is_ephemeral());
        assert!(ServiceKey::from_secret(None).is_ephemeral());
    }

    #[test]
    fn short_hex_is_lowercase_and_truncated() {
        assert_eq!(short_hex(&[0x0a, 0xff, 0x10], 2), "0aff");
        assert_eq!(short_hex(&[0xab], 8), "ab");
        let id = ServiceKey::from_secret(Some("s"));
        assert_eq!(id.key_id(), hex::encode(&Sha256::digest(b"s")[..8]));
    }

    #[tokio::test]
    async fn wallet_count_follows_the_store() {
        let svc = service();
        assert_eq!(svc.wallet_count().await, 0);
        svc.create_escrow(&create_req(250_000), "admin").await.unwrap();
        assert_eq!(svc.wallet_count().await, 1);
        let _ = svc.create_escrow(&create_req(1), "admin").await;
        assert_eq!(svc.wallet_count().await, 1);
    }

    #[tokio::test]
    async fn below_minimum_is_rejected_before_storage() {
        let svc = service();
        let err = svc.create_escrow(&create_req(150_000), "ops").await.unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)));
    }

    #[tokio::test]
    async fn create_release_report_lifecycle() {
        let svc = service();
        let w = svc.create_escrow(&create_req(250_000), "ops").await.unwrap();
        assert_eq!(w.status, EscrowStatus::Active);
        assert_eq!(w.multisig_address.len(), 64);
        assert_eq!(w.audit_trail.len(), 1);

        let short = ReleaseEscrowRequest {
            wallet_id: w.id,
            approvals: vec!["alice".into(), "alice".into()],
            reason: None,
        };
        assert_eq!(
            svc.release_escrow(&short, "ops").await.unwrap_err(),
            EscrowError::InsufficientSignatures { have: 1, need: 2 }
        );

        let stranger = ReleaseEscrowRequest {
            wallet_id: w.id,
            approvals: vec!["alice".into(), "mallory".into()],
            reason: None,
        };
        assert_eq!(
            svc.release_escrow(&stranger, "ops").await.unwrap_err(),
            EscrowError::UnknownSignatory("mallory".into())
        );

        let ok = ReleaseEscrowRequest {
            wallet_id: w.id,
            approvals: vec!["alice".into(), " carol ".into()],
            reason: Some("milestone 1".into()),
        };
        let released = svc.release_escrow(&ok, "ops").await.unwrap();
        assert_eq!(released.status, EscrowStatus::Released);
        assert!(released.audit_trail[1].details.contains("milestone 1"));

        assert!(matches!(
            svc.release_escrow(&ok, "ops").await.unwrap_err(),
            EscrowError::InvalidTransition { from: EscrowStatus::Released, .. }
        ));

        let report = svc.report(w.id).await.unwrap();
        assert_eq!(report.audit_entries, 2);
        assert_eq!(report.timeline[0].action, AuditAction::Created);
        assert_eq!(report.timeline[1].action, AuditAction::Released);
    }

    #[tokio::test]
    async fn lock_then_dispute() {
        let svc = service();
        let w = svc.create_escrow(&create_req(300_000), "ops").await.unwrap();
        let action = WalletActionRequest {
            wallet_id: w.id,
            reason: Some("review".into()),
        };
        assert_eq!(svc.lock_escrow(&action, "ops").await.unwrap().status, EscrowStatus::Locked);
        assert!(matches!(
            svc.lock_escrow(&action, "ops").await.unwrap_err(),
            EscrowError::InvalidTransition { from: EscrowStatus::Locked, action: "lock" }
        ));
        let d = svc.dispute_escrow(&action, "client").await.unwrap();
        assert_eq!(d.status, EscrowStatus::Disputed);
        assert_eq!(d.audit_trail.last().unwrap().actor, "client");
    }

    #[tokio::test]
    async fn unknown_wallet_is_not_found() {
        let svc = service();
        let id = Uuid::new_v4();
        assert_eq!(svc.get_wallet(id).await.unwrap_err(), EscrowError::NotFound(id));
    }
}
