//! Loan Ledger Client
//!
//! Settlement contract 호출 래퍼.
//!
//! # Features
//! - 상태 변경 제출 (addCollateral / createLoan / fundLoan / repayLoan / liquidateLoan)
//! - 읽기 전용 조회 (getLoanInfo / getLoanTerms / getCollateralInfo)
//! - 계정 논스 관리
//!
//! # Design Decision
//!
//! 제출은 identity 단위로 직렬화 (논스 뮤텍스 보유 중 왕복):
//! - 같은 서명자의 두 제출이 같은 논스를 쓰지 않음
//! - `stale nonce` / 결과 불명 시 캐시된 논스를 버리고 다음 제출에서 재조회
//! - 레저가 거절한 제출은 논스를 소비하지 않음
//!
//! 조회 결과는 확인(confirmation)으로 쓰지 않음: 전이 확인은 제출 영수증에서만.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ethers::types::{Address, Bytes, U256};
use tokio::sync::Mutex;

use crate::error::{LendingError, Result};
use crate::services::codec::{
    decode_id, CollateralInfo, LedgerCall, LedgerQuery, LoanInfo, LoanTerms,
};
use crate::services::encryption::EncryptedField;
use crate::services::oracle::{Receipt, SettlementOracle, Transaction};
use crate::state::{AssetType, CollateralRecord, LoanRecord, LoanSchedule, LoanStatus};
use crate::types::{Amount, CollateralId, Identity, LoanId, SubmissionHandle};

/// 레저 접속 설정
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Settlement gateway URL
    pub oracle_url: String,
    /// Chain ID
    pub chain_id: u64,
    /// Settlement contract 주소
    pub contract: Address,
    /// 서명 주체
    pub caller: Identity,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            oracle_url: "http://localhost:8545".to_string(),
            chain_id: 31337, // Anvil default
            contract: Address::zero(),
            caller: Identity::from(Address::zero()),
        }
    }
}

/// 확인된 제출 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission<T> {
    pub handle: SubmissionHandle,
    pub block_number: u64,
    /// 레저가 전이를 적용한 시각 (펀딩 시작 시각)
    pub block_timestamp: u64,
    pub value: T,
}

impl<T> Submission<T> {
    fn from_receipt(receipt: &Receipt, value: T) -> Self {
        Self {
            handle: receipt.tx_hash,
            block_number: receipt.block_number,
            block_timestamp: receipt.block_timestamp,
            value,
        }
    }
}

/// Loan Ledger Client
///
/// # Example
/// ```ignore
/// let client = LoanLedgerClient::new(oracle, config);
/// let submission = client.submit_register_collateral(&value, &asset_type, "QmHash").await?;
/// println!("collateral {} in {:?}", submission.value, submission.handle);
/// ```
pub struct LoanLedgerClient<O> {
    oracle: Arc<O>,
    config: LedgerConfig,
    /// 다음 논스 캐시 (None이면 다음 제출에서 재조회)
    nonce: Mutex<Option<u64>>,
    closed: AtomicBool,
}

impl<O: SettlementOracle> LoanLedgerClient<O> {
    pub fn new(oracle: Arc<O>, config: LedgerConfig) -> Self {
        Self {
            oracle,
            config,
            nonce: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> Identity {
        self.config.caller
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn oracle(&self) -> &Arc<O> {
        &self.oracle
    }

    /// 이후 모든 제출/조회 거부
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!(caller = %self.config.caller, "ledger client shut down");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ============ Submissions ============

    pub async fn submit_register_collateral(
        &self,
        value: &EncryptedField,
        asset_type: &AssetType,
        metadata_hash: &str,
    ) -> Result<Submission<CollateralId>> {
        let call = LedgerCall::AddCollateral {
            encrypted_value: value.ciphertext.clone(),
            asset_type: asset_type.as_str().to_string(),
            metadata_hash: metadata_hash.to_string(),
            proof: value.proof.clone(),
        };
        let receipt = self.submit(call, U256::zero()).await?;
        let id = CollateralId(decode_id(&receipt.output)?);
        Ok(Submission::from_receipt(&receipt, id))
    }

    /// 이자율 필드의 증명은 원금 증명과 같은 제출에 묶이지 않음 (컨트랙트는 원금 증명 하나만 받음)
    pub async fn submit_create_loan(
        &self,
        collateral_id: CollateralId,
        principal: &EncryptedField,
        interest_rate: &EncryptedField,
        duration_seconds: u64,
    ) -> Result<Submission<LoanId>> {
        let call = LedgerCall::CreateLoan {
            collateral_id,
            encrypted_principal: principal.ciphertext.clone(),
            encrypted_interest_rate: interest_rate.ciphertext.clone(),
            duration_seconds,
            proof: principal.proof.clone(),
        };
        let receipt = self.submit(call, U256::zero()).await?;
        let id = LoanId(decode_id(&receipt.output)?);
        Ok(Submission::from_receipt(&receipt, id))
    }

    pub async fn submit_fund_loan(
        &self,
        loan_id: LoanId,
        amount: &EncryptedField,
        native_value: Amount,
    ) -> Result<Submission<()>> {
        let call = LedgerCall::FundLoan {
            loan_id,
            encrypted_amount: amount.ciphertext.clone(),
            proof: amount.proof.clone(),
        };
        let receipt = self.submit(call, native_value.to_u256()).await?;
        Ok(Submission::from_receipt(&receipt, ()))
    }

    pub async fn submit_repay_loan(
        &self,
        loan_id: LoanId,
        amount: &EncryptedField,
        native_value: Amount,
    ) -> Result<Submission<()>> {
        let call = LedgerCall::RepayLoan {
            loan_id,
            encrypted_amount: amount.ciphertext.clone(),
            proof: amount.proof.clone(),
        };
        let receipt = self.submit(call, native_value.to_u256()).await?;
        Ok(Submission::from_receipt(&receipt, ()))
    }

    pub async fn submit_liquidate_loan(&self, loan_id: LoanId) -> Result<Submission<()>> {
        let receipt = self.submit(LedgerCall::LiquidateLoan { loan_id }, U256::zero()).await?;
        Ok(Submission::from_receipt(&receipt, ()))
    }

    /// 서명/제출 (내부)
    async fn submit(&self, call: LedgerCall, value: U256) -> Result<Receipt> {
        self.ensure_open()?;
        let from = self.config.caller.address();

        // 왕복 동안 논스를 캐시에서 꺼내 보유 (도중에 취소되면 캐시는 비어 있음)
        let mut cached = self.nonce.lock().await;
        let nonce = match cached.take() {
            Some(nonce) => nonce,
            None => self.oracle.nonce(from).await?,
        };

        let name = call.name();
        let tx = Transaction {
            from,
            to: self.config.contract,
            nonce,
            chain_id: self.config.chain_id,
            data: call.encode(),
            value,
        };
        tracing::info!(call = name, %from, nonce, "submitting ledger transaction");

        match self.oracle.submit(tx).await {
            Ok(receipt) => {
                *cached = Some(nonce + 1);
                tracing::info!(
                    call = name,
                    tx_hash = ?receipt.tx_hash,
                    block = receipt.block_number,
                    "ledger transaction confirmed"
                );
                Ok(receipt)
            }
            Err(err) => {
                // 확정 거절만 논스를 되돌림
                if !err.permits_resubmit() && !err.outcome_unknown() {
                    *cached = Some(nonce);
                }
                tracing::warn!(call = name, nonce, error = %err, "ledger transaction failed");
                Err(err)
            }
        }
    }

    // ============ Queries ============

    pub async fn get_loan_info(&self, loan_id: LoanId) -> Result<LoanInfo> {
        let output = self.query(LedgerQuery::GetLoanInfo(loan_id)).await?;
        Ok(LoanInfo::decode(&output)?)
    }

    pub async fn get_loan_terms(&self, loan_id: LoanId) -> Result<LoanTerms> {
        let output = self.query(LedgerQuery::GetLoanTerms(loan_id)).await?;
        Ok(LoanTerms::decode(&output)?)
    }

    /// 확인된 대출 레코드 (info + terms 조합)
    pub async fn get_loan(&self, loan_id: LoanId) -> Result<LoanRecord> {
        let info = self.get_loan_info(loan_id).await?;
        let terms = self.get_loan_terms(loan_id).await?;
        let status = info.status()?;

        let schedule = match status {
            LoanStatus::Requested => None,
            _ => {
                let schedule = LoanSchedule::starting_at(info.start_time, terms.duration_seconds)?;
                if schedule.end_time != info.end_time {
                    return Err(LendingError::MalformedResponse(format!(
                        "{}: end time {} does not match start {} + duration {}",
                        loan_id, info.end_time, info.start_time, terms.duration_seconds
                    )));
                }
                Some(schedule)
            }
        };

        Ok(LoanRecord {
            id: loan_id,
            collateral_id: terms.collateral_id,
            borrower: Identity::from(info.borrower),
            lender: info.lender().map(Identity::from),
            encrypted_principal: terms.encrypted_principal,
            encrypted_interest_rate: terms.encrypted_interest_rate,
            duration_seconds: terms.duration_seconds,
            schedule,
            status,
        })
    }

    /// 확인된 담보 레코드 (점유 대출 포함)
    pub async fn get_collateral(&self, collateral_id: CollateralId) -> Result<CollateralRecord> {
        let output = self.query(LedgerQuery::GetCollateralInfo(collateral_id)).await?;
        let info = CollateralInfo::decode(&output)?;
        Ok(CollateralRecord {
            id: collateral_id,
            owner: Identity::from(info.owner),
            encrypted_value: info.encrypted_value,
            asset_type: AssetType::recorded(info.asset_type),
            metadata_hash: info.metadata_hash,
            status: info.status,
            active_loan: info.active_loan,
        })
    }

    async fn query(&self, query: LedgerQuery) -> Result<Bytes> {
        self.ensure_open()?;
        tracing::debug!(?query, "ledger query");
        self.oracle.call(self.config.contract, query.encode()).await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(LendingError::ClientClosed)
        } else {
            Ok(())
        }
    }
}
