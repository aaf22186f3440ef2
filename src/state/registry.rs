//! Collateral Registry
//!
//! 담보 레코드의 클라이언트 측 read-through 캐시.
//!
//! # Design Decision
//!
//! 레코드 변경은 레저 확인 이후에만:
//! - `register`: 제출 영수증의 id로 확정
//! - `mark_locked` / `mark_released`: 대출 전이가 확인된 뒤의 투영
//! - 진행 중인 전이는 `Tracked::Pending`으로만 표시 (id당 하나)

use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;

use crate::error::{LendingError, RejectReason, Result};
use crate::services::{EncryptedField, LoanLedgerClient, SettlementOracle};
use crate::state::models::{AssetPolicy, CollateralRecord, CollateralStatus};
use crate::state::overlay::{IdLocks, Overlay, PendingGuard, Tracked};
use crate::types::{CollateralId, LoanId};

pub type CollateralGuard = PendingGuard<CollateralId, CollateralRecord>;

pub struct CollateralRegistry<O> {
    ledger: Arc<LoanLedgerClient<O>>,
    policy: AssetPolicy,
    records: Overlay<CollateralId, CollateralRecord>,
    locks: IdLocks<CollateralId>,
}

impl<O: SettlementOracle> CollateralRegistry<O> {
    pub fn new(ledger: Arc<LoanLedgerClient<O>>, policy: AssetPolicy) -> Self {
        Self {
            ledger,
            policy,
            records: Overlay::new(),
            locks: IdLocks::new(),
        }
    }

    pub fn policy(&self) -> &AssetPolicy {
        &self.policy
    }

    /// 담보 등록
    ///
    /// 소유자는 레저 클라이언트의 서명 주체. 자산 태그는 제출 전에 정책 검사.
    pub async fn register(
        &self,
        encrypted_value: &EncryptedField,
        asset_type: &str,
        metadata_hash: &str,
    ) -> Result<CollateralId> {
        let asset_type = self.policy.validate(asset_type)?;
        let submission = self
            .ledger
            .submit_register_collateral(encrypted_value, &asset_type, metadata_hash)
            .await?;

        let id = submission.value;
        self.records.confirm(
            id,
            CollateralRecord {
                id,
                owner: self.ledger.identity(),
                encrypted_value: encrypted_value.ciphertext.clone(),
                asset_type,
                metadata_hash: metadata_hash.to_string(),
                status: CollateralStatus::Registered,
                active_loan: None,
            },
        );
        tracing::info!(%id, handle = ?submission.handle, "collateral registered");
        Ok(id)
    }

    /// 마지막으로 확인된 레코드
    pub fn get(&self, id: CollateralId) -> Option<CollateralRecord> {
        self.records.confirmed(id)
    }

    /// 확인 상태 + 대기 중인 전이
    pub fn view(&self, id: CollateralId) -> Option<Tracked<CollateralRecord>> {
        self.records.view(id)
    }

    pub fn ids(&self) -> Vec<CollateralId> {
        let mut ids = self.records.keys();
        ids.sort();
        ids
    }

    pub fn is_stale(&self, id: CollateralId) -> bool {
        self.records.is_stale(id)
    }

    /// 레저에서 확인 상태를 다시 읽음
    pub async fn refresh(&self, id: CollateralId) -> Result<CollateralRecord> {
        let _token = self.lock(id).await;
        self.reconcile(id).await
    }

    /// 확인된 펀딩의 투영: Locked + 참조 대출
    pub fn mark_locked(&self, id: CollateralId, loan_id: LoanId) -> Result<CollateralRecord> {
        self.project(id, |record| record.locked(loan_id))
    }

    /// 확인된 상환의 투영: Released (재사용 불가)
    pub fn mark_released(&self, id: CollateralId) -> Result<CollateralRecord> {
        self.project(id, CollateralRecord::released)
    }

    /// 확인된 대출 생성의 투영: 상태는 Registered 유지, 참조만 기록
    pub(crate) fn attach_loan(&self, id: CollateralId, loan_id: LoanId) -> Result<CollateralRecord> {
        self.project(id, |record| record.reserved_by(loan_id))
    }

    fn project(
        &self,
        id: CollateralId,
        f: impl FnOnce(&CollateralRecord) -> CollateralRecord,
    ) -> Result<CollateralRecord> {
        let current = self
            .records
            .confirmed(id)
            .ok_or(LendingError::CollateralNotAvailable(id))?;
        let projected = f(&current);
        self.records.confirm(id, projected.clone());
        tracing::debug!(%id, status = ?projected.status, "collateral projection applied");
        Ok(projected)
    }

    // ============ State machine hooks ============

    /// id 토큰 획득 (대출 → 담보 순서로만)
    pub(crate) async fn lock(&self, id: CollateralId) -> OwnedMutexGuard<()> {
        self.locks.acquire(id).await
    }

    /// 토큰 보유 중 호출: 캐시가 없거나 stale이면 재조회
    pub(crate) async fn current(&self, id: CollateralId) -> Result<CollateralRecord> {
        match self.records.confirmed(id) {
            Some(record) if !self.records.is_stale(id) => Ok(record),
            _ => self.reconcile(id).await,
        }
    }

    /// 새 대출이 참조할 수 있는 담보 (없는 id 포함 → CollateralNotAvailable)
    pub(crate) async fn available(&self, id: CollateralId) -> Result<CollateralRecord> {
        let record = self.current(id).await.map_err(|err| match err {
            LendingError::SubmissionRejected { reason: RejectReason::Reverted(_) } => {
                LendingError::CollateralNotAvailable(id)
            }
            other => other,
        })?;
        if record.is_available() {
            Ok(record)
        } else {
            Err(LendingError::CollateralNotAvailable(id))
        }
    }

    /// 펀딩으로 잠글 수 있는 담보 (Registered + 미참조 또는 해당 대출이 참조)
    pub(crate) async fn lockable(&self, id: CollateralId, loan_id: LoanId) -> Result<CollateralRecord> {
        let record = self.current(id).await?;
        let referenced_elsewhere = record.active_loan.is_some_and(|loan| loan != loan_id);
        if record.status == CollateralStatus::Registered && !referenced_elsewhere {
            Ok(record)
        } else {
            Err(LendingError::CollateralNotAvailable(id))
        }
    }

    pub(crate) fn begin(&self, record: &CollateralRecord, proposed: CollateralRecord) -> CollateralGuard {
        self.records.begin(record.id, record.clone(), proposed)
    }

    /// 확인 상태 재조회 (토큰 보유 중)
    ///
    /// 점유 대출도 레저 값으로 덮어씀: 취소된 생성이 반영된 경우도 여기서 드러남
    pub(crate) async fn reconcile(&self, id: CollateralId) -> Result<CollateralRecord> {
        let record = self.ledger.get_collateral(id).await?;
        self.records.confirm(id, record.clone());
        tracing::debug!(%id, status = ?record.status, "collateral reconciled");
        Ok(record)
    }
}
