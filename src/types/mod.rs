//! Common Types Module
//!
//! 애플리케이션 전반에서 사용되는 공통 타입 정의

use std::fmt;

use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

/// 제출 핸들 (트랜잭션 해시)
pub type SubmissionHandle = H256;

/// 이자율 고정소수점 스케일 ("8.5" → 85_000)
pub const RATE_SCALE: u64 = 10_000;

/// 암호화 가능한 최대 정수 (euint32)
pub const MAX_ENCRYPTED_VALUE: u64 = u32::MAX as u64;

/// 호출 주체 식별자 (Ethereum 주소)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(Address);

impl Identity {
    pub fn new(addr: &str) -> Result<Self, String> {
        let addr = addr.trim().to_lowercase();
        if !(addr.starts_with("0x") && addr.len() == 42) {
            return Err("Invalid Ethereum address format".to_string());
        }
        addr.parse::<Address>()
            .map(Self)
            .map_err(|e| format!("Invalid Ethereum address: {}", e))
    }

    pub fn address(&self) -> Address {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == Address::zero()
    }
}

impl From<Address> for Identity {
    fn from(addr: Address) -> Self {
        Self(addr)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// 담보 ID (레저가 부여)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollateralId(pub u64);

/// 대출 ID (레저가 부여)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoanId(pub u64);

impl fmt::Display for CollateralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "collateral#{}", self.0)
    }
}

impl fmt::Display for LoanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loan#{}", self.0)
    }
}

/// 금액 타입 (트랜잭션 native value)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Amount {
    pub value: u128,
    pub decimals: u8,
}

impl Amount {
    pub fn new(value: u128, decimals: u8) -> Self {
        Self { value, decimals }
    }

    /// ETH (18 decimals)
    pub fn eth(value: u128) -> Self {
        Self { value, decimals: 18 }
    }

    pub fn zero() -> Self {
        Self::eth(0)
    }

    pub fn to_u256(&self) -> U256 {
        U256::from(self.value)
    }

    /// 사람이 읽기 쉬운 형태로 변환 (로그용)
    pub fn to_human_readable(&self) -> f64 {
        self.value as f64 / 10f64.powi(self.decimals as i32)
    }
}

/// 만기 상환액 = 원금 + floor(원금 * 이자율 / 100)
///
/// 이자율은 대출 기간 전체에 대한 단리 (RATE_SCALE 고정소수점).
/// 두 입력 모두 u32 범위이므로 u64 곱셈은 오버플로우하지 않음.
pub fn repayment_due(principal: u64, rate_scaled: u64) -> u64 {
    principal + principal * rate_scaled / (100 * RATE_SCALE)
}

/// `0x` + 소문자 hex
pub fn to_prefixed_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// `0x` 접두사가 붙은 hex 문자열 디코딩
pub fn from_prefixed_hex(text: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(text.strip_prefix("0x").unwrap_or(text))
}
