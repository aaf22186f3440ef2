//! Loan State Machine
//!
//! ```text
//! Requested --fund(lender, amount)---> Funded     [amount == principal, collateral Registered → Locked]
//! Funded    --repay(amount)----------> Repaid     [amount == principal + interest, collateral → Released]
//! Funded    --default(now > endTime)-> Defaulted  [collateral stays Locked]
//! ```
//!
//! # Design Decision
//!
//! 전이 순서는 항상 동일:
//! 1. 대출 id 토큰 → 담보 id 토큰 (역순 획득 없음)
//! 2. 캐시가 stale이면 확인 상태 재조회
//! 3. 로컬 사전조건 검사 (실패 시 제출하지 않음)
//! 4. Pending overlay 시작 → 제출
//! 5. 영수증으로 확정, 실패 시 overlay 되돌림
//!
//! 호출이 취소되면 guard drop으로 overlay가 지워지고 id가 stale로 표시됨.
//!
//! # Interview Q&A
//!
//! Q: 왜 펀딩 시작 시각을 조회하지 않고 영수증에서 가져오는가?
//! A: 조회는 다른 writer와 경쟁할 수 있음
//!    - 전이를 적용한 블록의 timestamp가 곧 startTime
//!    - `endTime = startTime + durationSeconds`를 확정 시점에 계산

use std::sync::Arc;

use chrono::Utc;

use crate::error::{LendingError, RejectReason, Result};
use crate::services::{EncryptedField, LoanLedgerClient, SettlementOracle};
use crate::state::models::{LendingPolicy, LoanRecord};
use crate::state::overlay::{IdLocks, Overlay, PendingGuard, Tracked};
use crate::state::registry::CollateralRegistry;
use crate::types::{Amount, CollateralId, LoanId};

/// 실패한 제출의 overlay 정리
///
/// 상태와 무관한 거절(권한/증명)은 확인 상태를 유지,
/// 그 외(결과 불명, 상태 경합)는 재조회 대상으로 표시
pub(crate) fn resolve_failure<K, V>(guard: PendingGuard<K, V>, err: &LendingError)
where
    K: Eq + std::hash::Hash + Copy,
    V: Clone,
{
    match err {
        LendingError::SubmissionRejected {
            reason: RejectReason::Unauthorized | RejectReason::MalformedProof,
        } => guard.reject(),
        _ => guard.abandon(),
    }
}

pub struct LoanStateMachine<O> {
    ledger: Arc<LoanLedgerClient<O>>,
    registry: Arc<CollateralRegistry<O>>,
    allow_self_funding: bool,
    loans: Overlay<LoanId, LoanRecord>,
    locks: IdLocks<LoanId>,
}

impl<O: SettlementOracle> LoanStateMachine<O> {
    pub fn new(
        ledger: Arc<LoanLedgerClient<O>>,
        registry: Arc<CollateralRegistry<O>>,
        policy: &LendingPolicy,
    ) -> Self {
        Self {
            ledger,
            registry,
            allow_self_funding: policy.allow_self_funding,
            loans: Overlay::new(),
            locks: IdLocks::new(),
        }
    }

    /// 대출 신청
    pub async fn create(
        &self,
        collateral_id: CollateralId,
        principal: &EncryptedField,
        interest_rate: &EncryptedField,
        duration_seconds: i64,
    ) -> Result<LoanId> {
        let duration = u64::try_from(duration_seconds)
            .ok()
            .filter(|duration| *duration > 0)
            .ok_or(LendingError::InvalidDuration(duration_seconds))?;

        let _collateral_token = self.registry.lock(collateral_id).await;
        let collateral = self.registry.available(collateral_id).await?;

        // 대출 id가 아직 없으므로 담보에만 pending 표시
        let guard = self.registry.begin(&collateral, collateral.clone());
        let submission = match self
            .ledger
            .submit_create_loan(collateral_id, principal, interest_rate, duration)
            .await
        {
            Ok(submission) => submission,
            Err(err) => {
                resolve_failure(guard, &err);
                return Err(err);
            }
        };

        let loan_id = submission.value;
        self.registry.attach_loan(collateral_id, loan_id)?;
        guard.settle();

        self.loans.confirm(
            loan_id,
            LoanRecord::requested(
                loan_id,
                collateral_id,
                self.ledger.identity(),
                principal.ciphertext.clone(),
                interest_rate.ciphertext.clone(),
                duration,
            ),
        );
        tracing::info!(%loan_id, %collateral_id, handle = ?submission.handle, "loan requested");
        Ok(loan_id)
    }

    /// 대출 실행 (대출자 = 레저 클라이언트의 서명 주체)
    pub async fn fund(
        &self,
        loan_id: LoanId,
        amount: &EncryptedField,
        native_value: Amount,
    ) -> Result<LoanRecord> {
        let lender = self.ledger.identity();

        let _loan_token = self.locks.acquire(loan_id).await;
        let loan = self.current(loan_id).await?;
        loan.check_fund(lender, self.allow_self_funding)?;

        let _collateral_token = self.registry.lock(loan.collateral_id).await;
        let collateral = self.registry.lockable(loan.collateral_id, loan_id).await?;

        // 시작 시각은 영수증에서 확정, overlay에는 로컬 추정치
        let estimated_start = u64::try_from(Utc::now().timestamp()).unwrap_or_default();
        let loan_guard = self.loans.begin(loan_id, loan.clone(), loan.funded(lender, estimated_start)?);
        let collateral_guard = self.registry.begin(&collateral, collateral.locked(loan_id));

        let submission = match self.ledger.submit_fund_loan(loan_id, amount, native_value).await {
            Ok(submission) => submission,
            Err(err) => {
                resolve_failure(loan_guard, &err);
                resolve_failure(collateral_guard, &err);
                return Err(err);
            }
        };

        let funded = loan.funded(lender, submission.block_timestamp)?;
        loan_guard.confirm(funded.clone());
        self.registry.mark_locked(loan.collateral_id, loan_id)?;
        collateral_guard.settle();

        tracing::info!(
            %loan_id,
            %lender,
            start_time = submission.block_timestamp,
            end_time = ?funded.end_time(),
            "loan funded"
        );
        Ok(funded)
    }

    /// 상환 (금액 비교는 레저 측 암호문 연산)
    pub async fn repay(
        &self,
        loan_id: LoanId,
        amount: &EncryptedField,
        native_value: Amount,
    ) -> Result<LoanRecord> {
        let _loan_token = self.locks.acquire(loan_id).await;
        let loan = self.current(loan_id).await?;
        let repaid = loan.repaid()?;

        let _collateral_token = self.registry.lock(loan.collateral_id).await;
        let collateral = self.registry.current(loan.collateral_id).await?;

        let loan_guard = self.loans.begin(loan_id, loan.clone(), repaid);
        let collateral_guard = self.registry.begin(&collateral, collateral.released());

        match self.ledger.submit_repay_loan(loan_id, amount, native_value).await {
            Ok(submission) => {
                let repaid = loan_guard.proposed().clone();
                loan_guard.confirm_proposed();
                self.registry.mark_released(loan.collateral_id)?;
                collateral_guard.settle();
                tracing::info!(%loan_id, handle = ?submission.handle, "loan repaid");
                Ok(repaid)
            }
            Err(err) => {
                resolve_failure(loan_guard, &err);
                resolve_failure(collateral_guard, &err);
                Err(err)
            }
        }
    }

    /// 만기 초과 대출 청산 (외부 트리거)
    ///
    /// `now`는 레저 시계 기준 호출자 시각. 담보 처분은 정책 영역이므로 Locked 유지.
    pub async fn default_loan(&self, loan_id: LoanId, now: u64) -> Result<LoanRecord> {
        let _loan_token = self.locks.acquire(loan_id).await;
        let loan = self.current(loan_id).await?;
        loan.check_default(now)?;

        let guard = self.loans.begin(loan_id, loan.clone(), loan.defaulted()?);
        match self.ledger.submit_liquidate_loan(loan_id).await {
            Ok(submission) => {
                let defaulted = guard.proposed().clone();
                guard.confirm_proposed();
                tracing::warn!(%loan_id, handle = ?submission.handle, "loan defaulted");
                Ok(defaulted)
            }
            Err(err) => {
                resolve_failure(guard, &err);
                Err(err)
            }
        }
    }

    pub fn get(&self, loan_id: LoanId) -> Option<LoanRecord> {
        self.loans.confirmed(loan_id)
    }

    pub fn view(&self, loan_id: LoanId) -> Option<Tracked<LoanRecord>> {
        self.loans.view(loan_id)
    }

    pub fn is_stale(&self, loan_id: LoanId) -> bool {
        self.loans.is_stale(loan_id)
    }

    /// 확인 상태 재조회 (대출 + 참조 담보)
    pub async fn refresh_loan(&self, loan_id: LoanId) -> Result<LoanRecord> {
        let _loan_token = self.locks.acquire(loan_id).await;
        let record = self.reconcile(loan_id).await?;
        self.reconcile_collateral(&record).await?;
        Ok(record)
    }

    /// 토큰 보유 중 호출
    async fn current(&self, loan_id: LoanId) -> Result<LoanRecord> {
        match self.loans.confirmed(loan_id) {
            Some(record) if !self.loans.is_stale(loan_id) => Ok(record),
            Some(_) => {
                tracing::warn!(%loan_id, "reconciling stale loan before transition");
                let record = self.reconcile(loan_id).await?;
                self.reconcile_collateral(&record).await?;
                Ok(record)
            }
            None => self.reconcile(loan_id).await,
        }
    }

    async fn reconcile(&self, loan_id: LoanId) -> Result<LoanRecord> {
        let record = self.ledger.get_loan(loan_id).await?;
        self.loans.confirm(loan_id, record.clone());
        tracing::debug!(%loan_id, status = ?record.status, "loan reconciled");
        Ok(record)
    }

    async fn reconcile_collateral(&self, loan: &LoanRecord) -> Result<()> {
        let _collateral_token = self.registry.lock(loan.collateral_id).await;
        self.registry.reconcile(loan.collateral_id).await?;
        Ok(())
    }
}
