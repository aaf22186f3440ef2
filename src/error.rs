//! Error Handling Module
//!
//! Type-safe error taxonomy for the encrypted lending lifecycle.
//! Uses thiserror for domain errors; every failure reaches the initiating
//! caller as a typed reason (nothing is swallowed).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::types::{CollateralId, LoanId};

/// 레저 게이트웨이의 거절 사유
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// 호출자 권한 없음
    Unauthorized,
    /// 증명이 암호문과 일치하지 않음
    MalformedProof,
    /// 논스가 레저 상태와 불일치 (재조회 후 1회 재제출 가능)
    StaleNonce,
    /// 컨트랙트 revert 메시지
    Reverted(String),
}

impl RejectReason {
    /// 게이트웨이 reason 문자열 파싱
    pub fn from_reason(reason: &str) -> Self {
        match reason.trim().to_lowercase().as_str() {
            "unauthorized" => RejectReason::Unauthorized,
            "malformed proof" => RejectReason::MalformedProof,
            "stale nonce" => RejectReason::StaleNonce,
            _ => RejectReason::Reverted(reason.trim().to_string()),
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Unauthorized => write!(f, "unauthorized"),
            RejectReason::MalformedProof => write!(f, "malformed proof"),
            RejectReason::StaleNonce => write!(f, "stale nonce"),
            RejectReason::Reverted(msg) => write!(f, "{}", msg),
        }
    }
}

/// 대출 클라이언트 에러 타입
///
/// # Design Decision
///
/// 세 계층으로 구분:
/// - 파이프라인 (로컬): 인코딩/암호화 실패
/// - 사전조건 (로컬): 제출 전에 항상 검사, 자동 재시도 없음
/// - 원격: 오라클 거절 또는 도달 불가
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LendingError {
    // ============ Pipeline ============
    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("Encryption capability unavailable: {0}")]
    EncryptionUnavailable(String),

    // ============ Preconditions ============
    #[error("Invalid asset type: {0:?}")]
    InvalidAssetType(String),

    #[error("Invalid loan duration: {0} seconds")]
    InvalidDuration(i64),

    #[error("{0} is not available as collateral")]
    CollateralNotAvailable(CollateralId),

    #[error("{0} is already funded")]
    AlreadyFunded(LoanId),

    #[error("{0} is not funded")]
    NotFunded(LoanId),

    #[error("Lender and borrower must differ")]
    SelfFundingNotAllowed,

    #[error("{loan_id} is not due until {end_time} (now {now})")]
    LoanNotDue { loan_id: LoanId, end_time: u64, now: u64 },

    // ============ Remote ============
    #[error("Submission rejected: {reason}")]
    SubmissionRejected { reason: RejectReason },

    #[error("Settlement oracle unreachable: {0}")]
    OracleUnreachable(String),

    #[error("Malformed oracle response: {0}")]
    MalformedResponse(String),

    // ============ Lifecycle ============
    #[error("Operation cancelled after {after:?}")]
    Cancelled { after: Duration },

    #[error("Ledger client has been shut down")]
    ClientClosed,
}

impl LendingError {
    pub fn rejected(reason: RejectReason) -> Self {
        LendingError::SubmissionRejected { reason }
    }

    /// 호출자가 지수 백오프로 재시도할 수 있는 에러인지
    pub fn is_retryable(&self) -> bool {
        matches!(self, LendingError::OracleUnreachable(_))
    }

    /// 상태 재조회 후 1회 재제출이 허용되는지 (stale nonce 한정)
    pub fn permits_resubmit(&self) -> bool {
        matches!(
            self,
            LendingError::SubmissionRejected { reason: RejectReason::StaleNonce }
        )
    }

    /// 제출 전에 로컬에서 발생한 에러인지
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            LendingError::EncodingError(_)
                | LendingError::EncryptionUnavailable(_)
                | LendingError::InvalidAssetType(_)
                | LendingError::InvalidDuration(_)
                | LendingError::CollateralNotAvailable(_)
                | LendingError::AlreadyFunded(_)
                | LendingError::NotFunded(_)
                | LendingError::SelfFundingNotAllowed
                | LendingError::LoanNotDue { .. }
        )
    }

    /// 제출 결과가 레저에 반영되었는지 알 수 없는 경우
    pub(crate) fn outcome_unknown(&self) -> bool {
        matches!(
            self,
            LendingError::OracleUnreachable(_) | LendingError::Cancelled { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LendingError>;
