//! Services Module
//!
//! 암호화 파이프라인과 레저 접근 계층
//!
//! # Services
//! - `EncryptionPipeline`: 평문 → (암호문, 증명)
//! - `codec`: settlement contract ABI 인코딩
//! - `SettlementOracle`: 레저 전송 인터페이스 (`HttpOracle`, `SimulatedLedger`)
//! - `LoanLedgerClient`: 전이 제출 / 확인 상태 조회

pub mod codec;
mod encryption;
mod ledger;
mod oracle;
mod simulated;

pub use encryption::{
    encode_field, verify_proof, Ciphertext, EncodedPlaintext, EncryptedField,
    EncryptionPipeline, EncryptionScheme, FieldKind, Keyring, Plaintext, Proof, Sha256Scheme,
};
pub use ledger::{LedgerConfig, LoanLedgerClient, Submission};
pub use oracle::{HttpOracle, Receipt, SettlementOracle, Transaction};
pub use simulated::{SimulatedLedger, SIMULATED_CHAIN_ID, SIMULATED_CONTRACT};
