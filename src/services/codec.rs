//! Ledger Call Codec
//!
//! Settlement contract 호출의 ABI 인코딩/디코딩.
//!
//! # Wire Format
//!
//! ```text
//! calldata = selector(4 bytes) ++ abi.encode(args...)
//!
//! addCollateral(bytes,string,string,bytes)            -> uint256
//! createLoan(uint256,bytes,bytes,uint256,bytes)       -> uint256
//! fundLoan(uint256,bytes,bytes)          payable
//! repayLoan(uint256,bytes,bytes)         payable
//! liquidateLoan(uint256)
//! getLoanInfo(uint256)       -> (address,address,bool,bool,bool,uint256,uint256,string,string)
//! getLoanTerms(uint256)      -> (uint256,bytes,bytes,uint256)
//! getCollateralInfo(uint256) -> (address,bytes,string,string,uint8,uint256)
//! ```
//!
//! `getCollateralInfo`의 마지막 워드는 담보를 점유한 대출 id (없으면 0).
//! 펀딩 여부는 `lender != 0`으로 판단 (`startTime`은 0일 수 있음).

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, U256};
use thiserror::Error;

use crate::error::LendingError;
use crate::services::encryption::{Ciphertext, Proof};
use crate::state::{CollateralStatus, LoanStatus};
use crate::types::{CollateralId, LoanId};

/// 코덱 에러
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("calldata shorter than a selector")]
    TooShort,

    #[error("unknown selector 0x{0}")]
    UnknownSelector(String),

    #[error("abi decoding failed: {0}")]
    Abi(String),

    #[error("unexpected value in {context}: {detail}")]
    Layout { context: &'static str, detail: String },
}

impl From<CodecError> for LendingError {
    fn from(err: CodecError) -> Self {
        LendingError::MalformedResponse(err.to_string())
    }
}

type CodecResult<T> = std::result::Result<T, CodecError>;

// ============ Calls ============

const ADD_COLLATERAL: &str = "addCollateral";
const CREATE_LOAN: &str = "createLoan";
const FUND_LOAN: &str = "fundLoan";
const REPAY_LOAN: &str = "repayLoan";
const LIQUIDATE_LOAN: &str = "liquidateLoan";
const GET_LOAN_INFO: &str = "getLoanInfo";
const GET_LOAN_TERMS: &str = "getLoanTerms";
const GET_COLLATERAL_INFO: &str = "getCollateralInfo";

fn inputs(name: &str) -> Vec<ParamType> {
    match name {
        ADD_COLLATERAL => vec![ParamType::Bytes, ParamType::String, ParamType::String, ParamType::Bytes],
        CREATE_LOAN => vec![
            ParamType::Uint(256),
            ParamType::Bytes,
            ParamType::Bytes,
            ParamType::Uint(256),
            ParamType::Bytes,
        ],
        FUND_LOAN | REPAY_LOAN => vec![ParamType::Uint(256), ParamType::Bytes, ParamType::Bytes],
        _ => vec![ParamType::Uint(256)],
    }
}

fn selector(name: &str) -> [u8; 4] {
    abi::short_signature(name, &inputs(name))
}

fn with_selector(name: &str, tokens: &[Token]) -> Bytes {
    let mut data = selector(name).to_vec();
    data.extend(abi::encode(tokens));
    Bytes::from(data)
}

/// selector를 확인하고 인자 토큰을 반환
fn split_call(data: &[u8], names: &[&'static str]) -> CodecResult<(&'static str, Tokens)> {
    if data.len() < 4 {
        return Err(CodecError::TooShort);
    }
    let (head, body) = data.split_at(4);
    let name = names
        .iter()
        .copied()
        .find(|name| selector(name) == head)
        .ok_or_else(|| CodecError::UnknownSelector(hex::encode(head)))?;
    let tokens = abi::decode(&inputs(name), body).map_err(|e| CodecError::Abi(e.to_string()))?;
    Ok((name, Tokens::new(tokens, name)))
}

/// 상태 변경 호출
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCall {
    AddCollateral {
        encrypted_value: Ciphertext,
        asset_type: String,
        metadata_hash: String,
        proof: Proof,
    },
    CreateLoan {
        collateral_id: CollateralId,
        encrypted_principal: Ciphertext,
        encrypted_interest_rate: Ciphertext,
        duration_seconds: u64,
        proof: Proof,
    },
    FundLoan {
        loan_id: LoanId,
        encrypted_amount: Ciphertext,
        proof: Proof,
    },
    RepayLoan {
        loan_id: LoanId,
        encrypted_amount: Ciphertext,
        proof: Proof,
    },
    LiquidateLoan {
        loan_id: LoanId,
    },
}

impl LedgerCall {
    pub fn name(&self) -> &'static str {
        match self {
            LedgerCall::AddCollateral { .. } => ADD_COLLATERAL,
            LedgerCall::CreateLoan { .. } => CREATE_LOAN,
            LedgerCall::FundLoan { .. } => FUND_LOAN,
            LedgerCall::RepayLoan { .. } => REPAY_LOAN,
            LedgerCall::LiquidateLoan { .. } => LIQUIDATE_LOAN,
        }
    }

    pub fn encode(&self) -> Bytes {
        let tokens = match self {
            LedgerCall::AddCollateral { encrypted_value, asset_type, metadata_hash, proof } => vec![
                Token::Bytes(encrypted_value.as_bytes().to_vec()),
                Token::String(asset_type.clone()),
                Token::String(metadata_hash.clone()),
                Token::Bytes(proof.as_bytes().to_vec()),
            ],
            LedgerCall::CreateLoan {
                collateral_id,
                encrypted_principal,
                encrypted_interest_rate,
                duration_seconds,
                proof,
            } => vec![
                Token::Uint(U256::from(collateral_id.0)),
                Token::Bytes(encrypted_principal.as_bytes().to_vec()),
                Token::Bytes(encrypted_interest_rate.as_bytes().to_vec()),
                Token::Uint(U256::from(*duration_seconds)),
                Token::Bytes(proof.as_bytes().to_vec()),
            ],
            LedgerCall::FundLoan { loan_id, encrypted_amount, proof }
            | LedgerCall::RepayLoan { loan_id, encrypted_amount, proof } => vec![
                Token::Uint(U256::from(loan_id.0)),
                Token::Bytes(encrypted_amount.as_bytes().to_vec()),
                Token::Bytes(proof.as_bytes().to_vec()),
            ],
            LedgerCall::LiquidateLoan { loan_id } => vec![Token::Uint(U256::from(loan_id.0))],
        };
        with_selector(self.name(), &tokens)
    }

    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let (name, mut t) = split_call(
            data,
            &[ADD_COLLATERAL, CREATE_LOAN, FUND_LOAN, REPAY_LOAN, LIQUIDATE_LOAN],
        )?;
        let call = match name {
            ADD_COLLATERAL => LedgerCall::AddCollateral {
                encrypted_value: Ciphertext::from_bytes(t.bytes()?),
                asset_type: t.string()?,
                metadata_hash: t.string()?,
                proof: Proof::from_bytes(t.bytes()?),
            },
            CREATE_LOAN => LedgerCall::CreateLoan {
                collateral_id: CollateralId(t.u64()?),
                encrypted_principal: Ciphertext::from_bytes(t.bytes()?),
                encrypted_interest_rate: Ciphertext::from_bytes(t.bytes()?),
                duration_seconds: t.u64()?,
                proof: Proof::from_bytes(t.bytes()?),
            },
            FUND_LOAN => LedgerCall::FundLoan {
                loan_id: LoanId(t.u64()?),
                encrypted_amount: Ciphertext::from_bytes(t.bytes()?),
                proof: Proof::from_bytes(t.bytes()?),
            },
            REPAY_LOAN => LedgerCall::RepayLoan {
                loan_id: LoanId(t.u64()?),
                encrypted_amount: Ciphertext::from_bytes(t.bytes()?),
                proof: Proof::from_bytes(t.bytes()?),
            },
            _ => LedgerCall::LiquidateLoan { loan_id: LoanId(t.u64()?) },
        };
        Ok(call)
    }
}

/// 읽기 전용 조회
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerQuery {
    GetLoanInfo(LoanId),
    GetLoanTerms(LoanId),
    GetCollateralInfo(CollateralId),
}

impl LedgerQuery {
    pub fn encode(&self) -> Bytes {
        let (name, id) = match self {
            LedgerQuery::GetLoanInfo(id) => (GET_LOAN_INFO, id.0),
            LedgerQuery::GetLoanTerms(id) => (GET_LOAN_TERMS, id.0),
            LedgerQuery::GetCollateralInfo(id) => (GET_COLLATERAL_INFO, id.0),
        };
        with_selector(name, &[Token::Uint(U256::from(id))])
    }

    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let (name, mut t) = split_call(data, &[GET_LOAN_INFO, GET_LOAN_TERMS, GET_COLLATERAL_INFO])?;
        let id = t.u64()?;
        Ok(match name {
            GET_LOAN_INFO => LedgerQuery::GetLoanInfo(LoanId(id)),
            GET_LOAN_TERMS => LedgerQuery::GetLoanTerms(LoanId(id)),
            _ => LedgerQuery::GetCollateralInfo(CollateralId(id)),
        })
    }
}

// ============ Outputs ============

pub fn encode_id(id: u64) -> Bytes {
    Bytes::from(abi::encode(&[Token::Uint(U256::from(id))]))
}

pub fn decode_id(output: &[u8]) -> CodecResult<u64> {
    let tokens = abi::decode(&[ParamType::Uint(256)], output)
        .map_err(|e| CodecError::Abi(e.to_string()))?;
    Tokens::new(tokens, "id").u64()
}

/// `getLoanInfo` 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoanInfo {
    pub borrower: Address,
    /// 펀딩 전에는 zero address
    pub lender: Address,
    pub is_active: bool,
    pub is_repaid: bool,
    pub is_defaulted: bool,
    pub start_time: u64,
    pub end_time: u64,
    pub collateral_type: String,
    pub collateral_hash: String,
}

impl LoanInfo {
    fn params() -> Vec<ParamType> {
        vec![
            ParamType::Address,
            ParamType::Address,
            ParamType::Bool,
            ParamType::Bool,
            ParamType::Bool,
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::String,
            ParamType::String,
        ]
    }

    pub fn encode(&self) -> Bytes {
        Bytes::from(abi::encode(&[
            Token::Address(self.borrower),
            Token::Address(self.lender),
            Token::Bool(self.is_active),
            Token::Bool(self.is_repaid),
            Token::Bool(self.is_defaulted),
            Token::Uint(U256::from(self.start_time)),
            Token::Uint(U256::from(self.end_time)),
            Token::String(self.collateral_type.clone()),
            Token::String(self.collateral_hash.clone()),
        ]))
    }

    pub fn decode(output: &[u8]) -> CodecResult<Self> {
        let tokens = abi::decode(&Self::params(), output).map_err(|e| CodecError::Abi(e.to_string()))?;
        let mut t = Tokens::new(tokens, GET_LOAN_INFO);
        Ok(Self {
            borrower: t.address()?,
            lender: t.address()?,
            is_active: t.boolean()?,
            is_repaid: t.boolean()?,
            is_defaulted: t.boolean()?,
            start_time: t.u64()?,
            end_time: t.u64()?,
            collateral_type: t.string()?,
            collateral_hash: t.string()?,
        })
    }

    /// 플래그 조합에서 상태 도출
    pub fn status(&self) -> CodecResult<LoanStatus> {
        match (self.is_repaid, self.is_defaulted) {
            (true, true) => Err(CodecError::Layout {
                context: GET_LOAN_INFO,
                detail: "loan is both repaid and defaulted".to_string(),
            }),
            (true, false) => Ok(LoanStatus::Repaid),
            (false, true) => Ok(LoanStatus::Defaulted),
            _ if self.is_active && self.lender != Address::zero() => Ok(LoanStatus::Funded),
            _ if self.is_active => Ok(LoanStatus::Requested),
            _ => Err(CodecError::Layout {
                context: GET_LOAN_INFO,
                detail: "inactive loan without a terminal flag".to_string(),
            }),
        }
    }

    pub fn lender(&self) -> Option<Address> {
        (self.lender != Address::zero()).then_some(self.lender)
    }
}

/// `getLoanTerms` 결과 (암호화 필드 핸들)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoanTerms {
    pub collateral_id: CollateralId,
    pub encrypted_principal: Ciphertext,
    pub encrypted_interest_rate: Ciphertext,
    pub duration_seconds: u64,
}

impl LoanTerms {
    pub fn encode(&self) -> Bytes {
        Bytes::from(abi::encode(&[
            Token::Uint(U256::from(self.collateral_id.0)),
            Token::Bytes(self.encrypted_principal.as_bytes().to_vec()),
            Token::Bytes(self.encrypted_interest_rate.as_bytes().to_vec()),
            Token::Uint(U256::from(self.duration_seconds)),
        ]))
    }

    pub fn decode(output: &[u8]) -> CodecResult<Self> {
        let params = [ParamType::Uint(256), ParamType::Bytes, ParamType::Bytes, ParamType::Uint(256)];
        let tokens = abi::decode(&params, output).map_err(|e| CodecError::Abi(e.to_string()))?;
        let mut t = Tokens::new(tokens, GET_LOAN_TERMS);
        Ok(Self {
            collateral_id: CollateralId(t.u64()?),
            encrypted_principal: Ciphertext::from_bytes(t.bytes()?),
            encrypted_interest_rate: Ciphertext::from_bytes(t.bytes()?),
            duration_seconds: t.u64()?,
        })
    }
}

/// `getCollateralInfo` 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollateralInfo {
    pub owner: Address,
    pub encrypted_value: Ciphertext,
    pub asset_type: String,
    pub metadata_hash: String,
    pub status: CollateralStatus,
    /// 담보를 점유한 대출 (Released 이후 None)
    pub active_loan: Option<LoanId>,
}

impl CollateralInfo {
    pub fn encode(&self) -> Bytes {
        Bytes::from(abi::encode(&[
            Token::Address(self.owner),
            Token::Bytes(self.encrypted_value.as_bytes().to_vec()),
            Token::String(self.asset_type.clone()),
            Token::String(self.metadata_hash.clone()),
            Token::Uint(U256::from(self.status.code())),
            Token::Uint(U256::from(self.active_loan.map_or(0, |id| id.0))),
        ]))
    }

    pub fn decode(output: &[u8]) -> CodecResult<Self> {
        let params = [
            ParamType::Address,
            ParamType::Bytes,
            ParamType::String,
            ParamType::String,
            ParamType::Uint(8),
            ParamType::Uint(256),
        ];
        let tokens = abi::decode(&params, output).map_err(|e| CodecError::Abi(e.to_string()))?;
        let mut t = Tokens::new(tokens, GET_COLLATERAL_INFO);
        let owner = t.address()?;
        let encrypted_value = Ciphertext::from_bytes(t.bytes()?);
        let asset_type = t.string()?;
        let metadata_hash = t.string()?;
        let code = t.u64()?;
        let status = u8::try_from(code)
            .ok()
            .and_then(CollateralStatus::from_code)
            .ok_or_else(|| CodecError::Layout {
                context: GET_COLLATERAL_INFO,
                detail: format!("unknown collateral status {}", code),
            })?;
        let active_loan = match t.u64()? {
            0 => None,
            id => Some(LoanId(id)),
        };
        Ok(Self { owner, encrypted_value, asset_type, metadata_hash, status, active_loan })
    }
}

// ============ Token cursor ============

struct Tokens {
    iter: std::vec::IntoIter<Token>,
    context: &'static str,
}

impl Tokens {
    fn new(tokens: Vec<Token>, context: &'static str) -> Self {
        Self { iter: tokens.into_iter(), context }
    }

    fn next(&mut self, expected: &str) -> CodecResult<Token> {
        self.iter.next().ok_or_else(|| CodecError::Layout {
            context: self.context,
            detail: format!("missing {}", expected),
        })
    }

    fn mismatch(&self, expected: &str, token: Token) -> CodecError {
        CodecError::Layout {
            context: self.context,
            detail: format!("expected {}, got {:?}", expected, token),
        }
    }

    fn u64(&mut self) -> CodecResult<u64> {
        match self.next("uint")? {
            Token::Uint(value) if value <= U256::from(u64::MAX) => Ok(value.as_u64()),
            Token::Uint(value) => Err(CodecError::Layout {
                context: self.context,
                detail: format!("{} does not fit in u64", value),
            }),
            other => Err(self.mismatch("uint", other)),
        }
    }

    fn bytes(&mut self) -> CodecResult<Vec<u8>> {
        match self.next("bytes")? {
            Token::Bytes(bytes) => Ok(bytes),
            other => Err(self.mismatch("bytes", other)),
        }
    }

    fn string(&mut self) -> CodecResult<String> {
        match self.next("string")? {
            Token::String(text) => Ok(text),
            other => Err(self.mismatch("string", other)),
        }
    }

    fn address(&mut self) -> CodecResult<Address> {
        match self.next("address")? {
            Token::Address(addr) => Ok(addr),
            other => Err(self.mismatch("address", other)),
        }
    }

    fn boolean(&mut self) -> CodecResult<bool> {
        match self.next("bool")? {
            Token::Bool(flag) => Ok(flag),
            other => Err(self.mismatch("bool", other)),
        }
    }
}
