//! Simulated Settlement Ledger
//!
//! 테스트와 데모 바이너리용 프로세스 내 레저.
//! 실제 블록체인이 아니라 settlement oracle의 계약만 재현함:
//!
//! - 레저가 id 부여 (1부터 순차)
//! - 계정별 논스 검사 (불일치 → `stale nonce`)
//! - 증명 검증 (`proof == SHA-256(ciphertext)`)
//! - 암호화 필드 비교는 키 보유자(`Keyring`)를 통해 레저 측에서만 수행
//! - 수동 시계 (`advance_time`)

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256};
use sha3::{Digest, Keccak256};

use crate::error::{LendingError, RejectReason, Result};
use crate::services::codec::{encode_id, CollateralInfo, LedgerCall, LedgerQuery, LoanInfo, LoanTerms};
use crate::services::encryption::{verify_proof, Ciphertext, FieldKind, Keyring, Proof};
use crate::services::oracle::{Receipt, SettlementOracle, Transaction};
use crate::state::{CollateralStatus, LoanStatus};
use crate::types::{repayment_due, LoanId};

/// 데모 레저의 컨트랙트 주소
pub const SIMULATED_CONTRACT: Address = Address::repeat_byte(0x5e);

/// 데모 레저의 chain id (Anvil 기본값)
pub const SIMULATED_CHAIN_ID: u64 = 31337;

type Rejection = std::result::Result<Bytes, RejectReason>;

#[derive(Debug, Clone)]
struct StoredCollateral {
    owner: Address,
    encrypted_value: Ciphertext,
    asset_type: String,
    metadata_hash: String,
    status: CollateralStatus,
    /// 점유 대출 (생성 시 설정, 상환 시 해제)
    active_loan: Option<u64>,
}

#[derive(Debug, Clone)]
struct StoredLoan {
    collateral_id: u64,
    borrower: Address,
    lender: Option<Address>,
    principal: Ciphertext,
    interest_rate: Ciphertext,
    duration_seconds: u64,
    start_time: u64,
    end_time: u64,
    status: LoanStatus,
}

#[derive(Debug, Default)]
struct LedgerState {
    now: u64,
    block_number: u64,
    nonces: HashMap<Address, u64>,
    collaterals: BTreeMap<u64, StoredCollateral>,
    loans: BTreeMap<u64, StoredLoan>,
    liquidator: Option<Address>,
}

fn revert(message: &str) -> RejectReason {
    RejectReason::Reverted(message.to_string())
}

fn require_proof(ciphertext: &Ciphertext, proof: &Proof) -> std::result::Result<(), RejectReason> {
    if verify_proof(ciphertext, proof) {
        Ok(())
    } else {
        Err(RejectReason::MalformedProof)
    }
}

/// 키 보유자를 통한 암호문 평가
fn reveal(keyring: &Keyring, ciphertext: &Ciphertext, kind: FieldKind) -> std::result::Result<u64, RejectReason> {
    keyring
        .decrypt(ciphertext, kind)
        .ok_or_else(|| revert("ciphertext cannot be evaluated"))
}

impl LedgerState {
    fn apply(&mut self, from: Address, call: LedgerCall, keyring: &Keyring) -> Rejection {
        match call {
            LedgerCall::AddCollateral { encrypted_value, asset_type, metadata_hash, proof } => {
                require_proof(&encrypted_value, &proof)?;
                if asset_type.trim().is_empty() {
                    return Err(revert("empty asset type"));
                }
                let id = self.collaterals.keys().next_back().map_or(1, |last| last + 1);
                self.collaterals.insert(
                    id,
                    StoredCollateral {
                        owner: from,
                        encrypted_value,
                        asset_type,
                        metadata_hash,
                        status: CollateralStatus::Registered,
                        active_loan: None,
                    },
                );
                Ok(encode_id(id))
            }

            LedgerCall::CreateLoan {
                collateral_id,
                encrypted_principal,
                encrypted_interest_rate,
                duration_seconds,
                proof,
            } => {
                require_proof(&encrypted_principal, &proof)?;
                if duration_seconds == 0 {
                    return Err(revert("invalid duration"));
                }
                let collateral = self
                    .collaterals
                    .get(&collateral_id.0)
                    .ok_or_else(|| revert("collateral does not exist"))?;
                if collateral.owner != from {
                    return Err(RejectReason::Unauthorized);
                }
                let referenced = self
                    .loans
                    .values()
                    .any(|loan| loan.collateral_id == collateral_id.0 && !loan.status.is_terminal());
                if collateral.status != CollateralStatus::Registered || referenced {
                    return Err(revert("collateral not available"));
                }

                let id = self.loans.keys().next_back().map_or(1, |last| last + 1);
                self.loans.insert(
                    id,
                    StoredLoan {
                        collateral_id: collateral_id.0,
                        borrower: from,
                        lender: None,
                        principal: encrypted_principal,
                        interest_rate: encrypted_interest_rate,
                        duration_seconds,
                        start_time: 0,
                        end_time: 0,
                        status: LoanStatus::Requested,
                    },
                );
                if let Some(collateral) = self.collaterals.get_mut(&collateral_id.0) {
                    collateral.active_loan = Some(id);
                }
                Ok(encode_id(id))
            }

            LedgerCall::FundLoan { loan_id, encrypted_amount, proof } => {
                require_proof(&encrypted_amount, &proof)?;
                let loan = self.loans.get_mut(&loan_id.0).ok_or_else(|| revert("loan does not exist"))?;
                if loan.status != LoanStatus::Requested {
                    return Err(revert("loan already funded"));
                }
                let principal = reveal(keyring, &loan.principal, FieldKind::Amount)?;
                let amount = reveal(keyring, &encrypted_amount, FieldKind::Amount)?;
                if amount != principal {
                    return Err(revert("amount does not match principal"));
                }
                let collateral = self
                    .collaterals
                    .get_mut(&loan.collateral_id)
                    .filter(|c| c.status == CollateralStatus::Registered)
                    .ok_or_else(|| revert("collateral not available"))?;

                collateral.status = CollateralStatus::Locked;
                loan.lender = Some(from);
                loan.start_time = self.now;
                loan.end_time = self.now + loan.duration_seconds;
                loan.status = LoanStatus::Funded;
                Ok(Bytes::new())
            }

            LedgerCall::RepayLoan { loan_id, encrypted_amount, proof } => {
                require_proof(&encrypted_amount, &proof)?;
                let loan = self.loans.get_mut(&loan_id.0).ok_or_else(|| revert("loan does not exist"))?;
                if loan.status != LoanStatus::Funded {
                    return Err(revert("loan not funded"));
                }
                if loan.borrower != from {
                    return Err(RejectReason::Unauthorized);
                }
                let principal = reveal(keyring, &loan.principal, FieldKind::Amount)?;
                let rate = reveal(keyring, &loan.interest_rate, FieldKind::Rate)?;
                let amount = reveal(keyring, &encrypted_amount, FieldKind::Amount)?;
                if amount != repayment_due(principal, rate) {
                    return Err(revert("repayment does not match amount due"));
                }

                loan.status = LoanStatus::Repaid;
                if let Some(collateral) = self.collaterals.get_mut(&loan.collateral_id) {
                    collateral.status = CollateralStatus::Released;
                    collateral.active_loan = None;
                }
                Ok(Bytes::new())
            }

            LedgerCall::LiquidateLoan { loan_id } => {
                if self.liquidator.is_some_and(|liquidator| liquidator != from) {
                    return Err(RejectReason::Unauthorized);
                }
                let now = self.now;
                let loan = self.loans.get_mut(&loan_id.0).ok_or_else(|| revert("loan does not exist"))?;
                if loan.status != LoanStatus::Funded {
                    return Err(revert("loan not funded"));
                }
                if now <= loan.end_time {
                    return Err(revert("loan not due"));
                }
                // 담보 처분은 청산자 정책 (Locked 유지)
                loan.status = LoanStatus::Defaulted;
                Ok(Bytes::new())
            }
        }
    }

    fn query(&self, query: LedgerQuery) -> Rejection {
        match query {
            LedgerQuery::GetLoanInfo(id) => {
                let loan = self.loans.get(&id.0).ok_or_else(|| revert("loan does not exist"))?;
                let collateral = self
                    .collaterals
                    .get(&loan.collateral_id)
                    .ok_or_else(|| revert("collateral does not exist"))?;
                Ok(LoanInfo {
                    borrower: loan.borrower,
                    lender: loan.lender.unwrap_or_else(Address::zero),
                    is_active: !loan.status.is_terminal(),
                    is_repaid: loan.status == LoanStatus::Repaid,
                    is_defaulted: loan.status == LoanStatus::Defaulted,
                    start_time: loan.start_time,
                    end_time: loan.end_time,
                    collateral_type: collateral.asset_type.clone(),
                    collateral_hash: collateral.metadata_hash.clone(),
                }
                .encode())
            }
            LedgerQuery::GetLoanTerms(id) => {
                let loan = self.loans.get(&id.0).ok_or_else(|| revert("loan does not exist"))?;
                Ok(LoanTerms {
                    collateral_id: crate::types::CollateralId(loan.collateral_id),
                    encrypted_principal: loan.principal.clone(),
                    encrypted_interest_rate: loan.interest_rate.clone(),
                    duration_seconds: loan.duration_seconds,
                }
                .encode())
            }
            LedgerQuery::GetCollateralInfo(id) => {
                let collateral = self
                    .collaterals
                    .get(&id.0)
                    .ok_or_else(|| revert("collateral does not exist"))?;
                Ok(CollateralInfo {
                    owner: collateral.owner,
                    encrypted_value: collateral.encrypted_value.clone(),
                    asset_type: collateral.asset_type.clone(),
                    metadata_hash: collateral.metadata_hash.clone(),
                    status: collateral.status,
                    active_loan: collateral.active_loan.map(LoanId),
                }
                .encode())
            }
        }
    }
}

/// 프로세스 내 settlement oracle
///
/// # Example
/// ```ignore
/// let keyring = Arc::new(Keyring::new());
/// let ledger = Arc::new(SimulatedLedger::new(keyring.clone(), 1_700_000_000));
/// ledger.advance_time(86_400);
/// ```
#[derive(Debug)]
pub struct SimulatedLedger {
    contract: Address,
    chain_id: u64,
    keyring: Arc<Keyring>,
    state: Mutex<LedgerState>,
    reachable: AtomicBool,
    submissions: AtomicU64,
}

impl SimulatedLedger {
    pub fn new(keyring: Arc<Keyring>, genesis_time: u64) -> Self {
        Self {
            contract: SIMULATED_CONTRACT,
            chain_id: SIMULATED_CHAIN_ID,
            keyring,
            state: Mutex::new(LedgerState { now: genesis_time, ..Default::default() }),
            reachable: AtomicBool::new(true),
            submissions: AtomicU64::new(0),
        }
    }

    /// 청산 권한 계정 지정 (미지정 시 누구나 청산 가능)
    pub fn with_liquidator(mut self, liquidator: Address) -> Self {
        self.state.get_mut().unwrap_or_else(PoisonError::into_inner).liquidator = Some(liquidator);
        self
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn now(&self) -> u64 {
        self.lock().now
    }

    pub fn advance_time(&self, seconds: u64) {
        self.lock().now += seconds;
    }

    /// 네트워크 단절 시뮬레이션
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// 레저에 반영된 트랜잭션 수
    pub fn submission_count(&self) -> u64 {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn collateral_status(&self, id: u64) -> Option<CollateralStatus> {
        self.lock().collaterals.get(&id).map(|c| c.status)
    }

    pub fn loan_status(&self, id: u64) -> Option<LoanStatus> {
        self.lock().loans.get(&id).map(|l| l.status)
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LendingError::OracleUnreachable("simulated network partition".to_string()))
        }
    }

    fn tx_hash(tx: &Transaction) -> H256 {
        let mut hasher = Keccak256::new();
        hasher.update(tx.from.as_bytes());
        hasher.update(tx.nonce.to_be_bytes());
        hasher.update(&tx.data);
        H256::from_slice(&hasher.finalize())
    }
}

#[async_trait]
impl SettlementOracle for SimulatedLedger {
    async fn nonce(&self, account: Address) -> Result<u64> {
        self.ensure_reachable()?;
        Ok(self.lock().nonces.get(&account).copied().unwrap_or(0))
    }

    async fn submit(&self, tx: Transaction) -> Result<Receipt> {
        self.ensure_reachable()?;

        let mut state = self.lock();
        if tx.to != self.contract || tx.chain_id != self.chain_id {
            return Err(LendingError::rejected(revert("unknown contract")));
        }
        let expected = state.nonces.get(&tx.from).copied().unwrap_or(0);
        if tx.nonce != expected {
            return Err(LendingError::rejected(RejectReason::StaleNonce));
        }
        let call = LedgerCall::decode(&tx.data).map_err(|e| {
            LendingError::rejected(RejectReason::Reverted(format!("malformed calldata: {}", e)))
        })?;
        let name = call.name();
        let output = state.apply(tx.from, call, &self.keyring).map_err(LendingError::rejected)?;

        state.nonces.insert(tx.from, expected + 1);
        state.block_number += 1;
        self.submissions.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(call = name, block = state.block_number, "simulated ledger applied transaction");

        Ok(Receipt {
            tx_hash: Self::tx_hash(&tx),
            block_number: state.block_number,
            block_timestamp: state.now,
            output,
        })
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        self.ensure_reachable()?;
        if to != self.contract {
            return Err(LendingError::rejected(revert("unknown contract")));
        }
        let query = LedgerQuery::decode(&data)?;
        self.lock().query(query).map_err(LendingError::rejected)
    }
}
