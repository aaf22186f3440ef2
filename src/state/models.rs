//! Record models and pure lifecycle transitions
//!
//! 레코드의 소유/변경 주체는 settlement oracle.
//! 여기의 전이 함수는 "확인된 결과를 캐시에 적용"할 때와
//! "제출 전 사전조건 검사"에만 사용됨.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{LendingError, Result};
use crate::services::Ciphertext;
use crate::types::{CollateralId, Identity, LoanId};

// ============ Collateral ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollateralStatus {
    Registered,
    Locked,
    Released,
}

impl CollateralStatus {
    /// `getCollateralInfo`의 uint8 코드
    pub fn code(self) -> u8 {
        match self {
            CollateralStatus::Registered => 0,
            CollateralStatus::Locked => 1,
            CollateralStatus::Released => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CollateralStatus::Registered),
            1 => Some(CollateralStatus::Locked),
            2 => Some(CollateralStatus::Released),
            _ => None,
        }
    }
}

/// 담보 자산 종류 태그
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetType(String);

impl AssetType {
    /// 레저에 이미 기록된 태그 (정책 검사 생략)
    pub(crate) fn recorded(tag: String) -> Self {
        Self(tag)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 자산 종류 정책
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AssetPolicy {
    /// 비어 있지 않은 모든 태그 허용
    #[default]
    Open,
    /// 설정된 목록만 허용
    Closed(BTreeSet<String>),
}

impl AssetPolicy {
    pub fn closed<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AssetPolicy::Closed(tags.into_iter().map(Into::into).collect())
    }

    /// 기본 폐쇄 목록 (대출 신청 폼의 자산 분류 + 담보 등록 예시 태그)
    pub fn standard() -> Self {
        Self::closed([
            "property",
            "vehicle",
            "equipment",
            "inventory",
            "other",
            "real_estate",
            "precious_metals",
            "artwork",
        ])
    }

    pub fn validate(&self, tag: &str) -> Result<AssetType> {
        let tag = tag.trim();
        let accepted = match self {
            AssetPolicy::Open => !tag.is_empty(),
            AssetPolicy::Closed(allowed) => allowed.contains(tag),
        };
        if accepted {
            Ok(AssetType(tag.to_string()))
        } else {
            Err(LendingError::InvalidAssetType(tag.to_string()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateralRecord {
    pub id: CollateralId,
    pub owner: Identity,
    pub encrypted_value: Ciphertext,
    pub asset_type: AssetType,
    /// content-addressed 참조 (IPFS 해시 등)
    pub metadata_hash: String,
    pub status: CollateralStatus,
    /// 이 담보를 참조하는 비종료 대출
    pub active_loan: Option<LoanId>,
}

impl CollateralRecord {
    /// 새 대출을 받을 수 있는 상태인지 (Registered + 미참조)
    pub fn is_available(&self) -> bool {
        self.status == CollateralStatus::Registered && self.active_loan.is_none()
    }

    pub fn reserved_by(&self, loan_id: LoanId) -> Self {
        Self { active_loan: Some(loan_id), ..self.clone() }
    }

    pub fn locked(&self, loan_id: LoanId) -> Self {
        Self {
            status: CollateralStatus::Locked,
            active_loan: Some(loan_id),
            ..self.clone()
        }
    }

    pub fn released(&self) -> Self {
        Self {
            status: CollateralStatus::Released,
            active_loan: None,
            ..self.clone()
        }
    }
}

// ============ Loan ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoanStatus {
    Requested,
    Funded,
    Repaid,
    Defaulted,
}

impl LoanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoanStatus::Repaid | LoanStatus::Defaulted)
    }
}

/// 펀딩 시점에 원자적으로 설정되는 기간
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanSchedule {
    pub start_time: u64,
    pub end_time: u64,
}

impl LoanSchedule {
    /// `end_time = start_time + duration_seconds`
    pub fn starting_at(start_time: u64, duration_seconds: u64) -> Result<Self> {
        let end_time = start_time.checked_add(duration_seconds).ok_or_else(|| {
            LendingError::MalformedResponse(format!(
                "start time {} + duration {} overflows",
                start_time, duration_seconds
            ))
        })?;
        Ok(Self { start_time, end_time })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanRecord {
    pub id: LoanId,
    pub collateral_id: CollateralId,
    pub borrower: Identity,
    pub lender: Option<Identity>,
    pub encrypted_principal: Ciphertext,
    pub encrypted_interest_rate: Ciphertext,
    pub duration_seconds: u64,
    /// Funded 이전에는 항상 None
    pub schedule: Option<LoanSchedule>,
    pub status: LoanStatus,
}

impl LoanRecord {
    pub fn requested(
        id: LoanId,
        collateral_id: CollateralId,
        borrower: Identity,
        encrypted_principal: Ciphertext,
        encrypted_interest_rate: Ciphertext,
        duration_seconds: u64,
    ) -> Self {
        Self {
            id,
            collateral_id,
            borrower,
            lender: None,
            encrypted_principal,
            encrypted_interest_rate,
            duration_seconds,
            schedule: None,
            status: LoanStatus::Requested,
        }
    }

    pub fn end_time(&self) -> Option<u64> {
        self.schedule.map(|s| s.end_time)
    }

    /// Requested → Funded 사전조건
    pub fn check_fund(&self, lender: Identity, allow_self_funding: bool) -> Result<()> {
        if self.status != LoanStatus::Requested {
            return Err(LendingError::AlreadyFunded(self.id));
        }
        if !allow_self_funding && lender == self.borrower {
            return Err(LendingError::SelfFundingNotAllowed);
        }
        Ok(())
    }

    /// 확인된 펀딩 적용
    pub fn funded(&self, lender: Identity, start_time: u64) -> Result<Self> {
        if self.status != LoanStatus::Requested {
            return Err(LendingError::AlreadyFunded(self.id));
        }
        Ok(Self {
            lender: Some(lender),
            schedule: Some(LoanSchedule::starting_at(start_time, self.duration_seconds)?),
            status: LoanStatus::Funded,
            ..self.clone()
        })
    }

    /// Funded → Repaid 사전조건
    pub fn check_repay(&self) -> Result<()> {
        if self.status != LoanStatus::Funded {
            return Err(LendingError::NotFunded(self.id));
        }
        Ok(())
    }

    pub fn repaid(&self) -> Result<Self> {
        self.check_repay()?;
        Ok(Self { status: LoanStatus::Repaid, ..self.clone() })
    }

    /// Funded → Defaulted 사전조건 (`now > end_time`)
    pub fn check_default(&self, now: u64) -> Result<()> {
        self.check_repay()?;
        match self.schedule {
            Some(schedule) if now > schedule.end_time => Ok(()),
            Some(schedule) => Err(LendingError::LoanNotDue {
                loan_id: self.id,
                end_time: schedule.end_time,
                now,
            }),
            None => Err(LendingError::NotFunded(self.id)),
        }
    }

    pub fn defaulted(&self) -> Result<Self> {
        self.check_repay()?;
        Ok(Self { status: LoanStatus::Defaulted, ..self.clone() })
    }
}

/// 로컬 정책
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LendingPolicy {
    pub asset_types: AssetPolicy,
    /// 차입자 == 대출자 허용 여부 (기본: 불허)
    pub allow_self_funding: bool,
}
