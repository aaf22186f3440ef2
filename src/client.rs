//! Lending Client
//!
//! 호출자(UI 협력자)용 단일 진입점:
//! 평문 입력 → 암호화 파이프라인 → 상태 머신 → 레저 제출
//!
//! # Design Decision
//!
//! 전역 컨트랙트 클라이언트 대신 명시적으로 생성/종료하는 객체:
//! - 생성: endpoint + identity (`Config` 또는 `LedgerConfig`)
//! - 종료: `shutdown()` 이후 모든 호출은 `ClientClosed`
//! - 모든 작업에 호출자 기한(timeout) 적용, 초과 시 `Cancelled`

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::{LendingError, Result};
use crate::services::{
    encode_field, EncryptionPipeline, FieldKind, HttpOracle, LedgerConfig, LoanLedgerClient,
    Plaintext, SettlementOracle,
};
use crate::state::{CollateralRegistry, LendingPolicy, LoanRecord, LoanStateMachine};
use crate::types::{repayment_due, Amount, CollateralId, Identity, LoanId, MAX_ENCRYPTED_VALUE};

/// 기본 호출 기한
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Lending Client
///
/// # Example
/// ```ignore
/// let client = LendingClient::new(pipeline, oracle, ledger_config, LendingPolicy::default());
/// let collateral = client.add_collateral("50000", "real_estate", "QmHash").await?;
/// let loan = client.create_loan(collateral, "40000", "8.5", 2_592_000).await?;
/// ```
pub struct LendingClient<O> {
    pipeline: EncryptionPipeline,
    ledger: Arc<LoanLedgerClient<O>>,
    registry: Arc<CollateralRegistry<O>>,
    loans: LoanStateMachine<O>,
    timeout: Duration,
}

impl LendingClient<HttpOracle> {
    /// 환경 설정으로 게이트웨이 클라이언트 구성
    pub fn from_config(config: &Config, pipeline: EncryptionPipeline) -> Result<Self> {
        if config.caller.is_zero() {
            tracing::warn!("CALLER_ADDRESS not set; submissions will be rejected by the gateway");
        }
        let oracle = Arc::new(HttpOracle::new(&config.oracle_url, config.submission_timeout)?);
        Ok(Self::new(pipeline, oracle, config.ledger_config(), config.policy())
            .with_timeout(config.submission_timeout))
    }
}

impl<O: SettlementOracle> LendingClient<O> {
    pub fn new(
        pipeline: EncryptionPipeline,
        oracle: Arc<O>,
        ledger_config: LedgerConfig,
        policy: LendingPolicy,
    ) -> Self {
        let ledger = Arc::new(LoanLedgerClient::new(oracle, ledger_config));
        let registry = Arc::new(CollateralRegistry::new(ledger.clone(), policy.asset_types.clone()));
        let loans = LoanStateMachine::new(ledger.clone(), registry.clone(), &policy);

        Self {
            pipeline,
            ledger,
            registry,
            loans,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn identity(&self) -> Identity {
        self.ledger.identity()
    }

    pub fn ledger(&self) -> &LoanLedgerClient<O> {
        &self.ledger
    }

    pub fn collaterals(&self) -> &CollateralRegistry<O> {
        &self.registry
    }

    pub fn loans(&self) -> &LoanStateMachine<O> {
        &self.loans
    }

    // ============ Transitions ============

    pub async fn add_collateral(
        &self,
        value: impl Into<Plaintext>,
        asset_type: &str,
        metadata_hash: &str,
    ) -> Result<CollateralId> {
        let value = value.into();
        self.with_deadline("add_collateral", async {
            let encrypted = self.pipeline.encrypt_field(&value, FieldKind::Amount)?;
            self.registry.register(&encrypted, asset_type, metadata_hash).await
        })
        .await
    }

    /// 대출 신청
    ///
    /// 상환액이 암호화 범위를 넘는 조건은 상환이 불가능하므로 암호화 전에 거절
    pub async fn create_loan(
        &self,
        collateral_id: CollateralId,
        principal: impl Into<Plaintext>,
        interest_rate: impl Into<Plaintext>,
        duration_seconds: i64,
    ) -> Result<LoanId> {
        let (principal, interest_rate) = (principal.into(), interest_rate.into());
        let due = due_for(&principal, &interest_rate)?;
        if due > MAX_ENCRYPTED_VALUE {
            return Err(LendingError::EncodingError(format!(
                "repayment due {} exceeds the encryptable range",
                due
            )));
        }
        self.with_deadline("create_loan", async {
            let principal = self.pipeline.encrypt_field(&principal, FieldKind::Amount)?;
            let interest_rate = self.pipeline.encrypt_field(&interest_rate, FieldKind::Rate)?;
            self.loans
                .create(collateral_id, &principal, &interest_rate, duration_seconds)
                .await
        })
        .await
    }

    pub async fn fund_loan(
        &self,
        loan_id: LoanId,
        amount: impl Into<Plaintext>,
        native_value: Amount,
    ) -> Result<LoanRecord> {
        let amount = amount.into();
        self.with_deadline("fund_loan", async {
            let amount = self.pipeline.encrypt_field(&amount, FieldKind::Amount)?;
            self.loans.fund(loan_id, &amount, native_value).await
        })
        .await
    }

    /// 다른 주체(대출자)의 전이는 `refresh_loan` 이후에 캐시에 반영됨
    pub async fn repay_loan(
        &self,
        loan_id: LoanId,
        amount: impl Into<Plaintext>,
        native_value: Amount,
    ) -> Result<LoanRecord> {
        let amount = amount.into();
        self.with_deadline("repay_loan", async {
            let amount = self.pipeline.encrypt_field(&amount, FieldKind::Amount)?;
            self.loans.repay(loan_id, &amount, native_value).await
        })
        .await
    }

    /// 만기 초과 대출 청산 (`now`: 레저 시계 기준)
    pub async fn liquidate_loan(&self, loan_id: LoanId, now: u64) -> Result<LoanRecord> {
        self.with_deadline("liquidate_loan", self.loans.default_loan(loan_id, now))
            .await
    }

    pub async fn refresh_loan(&self, loan_id: LoanId) -> Result<LoanRecord> {
        self.with_deadline("refresh_loan", self.loans.refresh_loan(loan_id))
            .await
    }

    /// 차입자가 알고 있는 평문 조건으로 상환액 계산
    ///
    /// `principal + floor(principal * rate / 100)`, 기간 전체에 대한 단일 이자
    pub fn repayment_due(
        &self,
        principal: impl Into<Plaintext>,
        interest_rate: impl Into<Plaintext>,
    ) -> Result<u64> {
        due_for(&principal.into(), &interest_rate.into())
    }

    pub fn shutdown(&self) {
        self.ledger.shutdown();
    }

    async fn with_deadline<T>(
        &self,
        operation: &'static str,
        future: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, future).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(operation, timeout = ?self.timeout, "operation cancelled by deadline");
                Err(LendingError::Cancelled { after: self.timeout })
            }
        }
    }
}

fn due_for(principal: &Plaintext, interest_rate: &Plaintext) -> Result<u64> {
    let principal = encode_field(principal, FieldKind::Amount)?;
    let rate = encode_field(interest_rate, FieldKind::Rate)?;
    Ok(repayment_due(principal.scaled, rate.scaled))
}
