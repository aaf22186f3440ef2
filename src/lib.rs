//! Vault Loan Shield
//!
//! # Overview
//!
//! 담보 가치, 원금, 이자율, 상환액을 평문으로 노출하지 않는 대출 클라이언트.
//! 모든 금액 필드는 `(Ciphertext, Proof)` 쌍으로 제출되고, 비교 연산은
//! 레저(settlement oracle) 측에서만 수행됩니다.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     LendingClient                        │
//! │                                                          │
//! │  ┌────────────┐  ┌────────────┐  ┌──────────────────┐   │
//! │  │ Encryption │─▶│   State    │─▶│ LoanLedgerClient │   │
//! │  │  Pipeline  │  │ (Registry, │  │  (codec, nonce)  │   │
//! │  └────────────┘  │  Loans)    │  └────────┬─────────┘   │
//! │                  └────────────┘           │             │
//! └───────────────────────────────────────────┼─────────────┘
//!                                             │
//!                                             ▼
//!                                  ┌────────────────────┐
//!                                  │ SettlementOracle   │
//!                                  │ (HTTP / Simulated) │
//!                                  └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `config`: 환경 설정 관리
//! - `error`: 에러 타입 및 분류
//! - `services`: 암호화 파이프라인, ABI 코덱, 오라클 전송, 레저 클라이언트
//! - `state`: 담보/대출 캐시와 생명주기 전이
//! - `client`: 호출자용 facade
//! - `types`: 공통 타입 정의
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vault_loan_shield::{config::Config, EncryptionPipeline, LendingClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let client = LendingClient::from_config(&config, EncryptionPipeline::sha256())?;
//!
//!     let loan = client.refresh_loan(LoanId(1)).await?;
//!     println!("{:?}", loan.status);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod services;
pub mod state;
pub mod types;

#[cfg(test)]
mod tests;

// Re-exports for convenience
pub use client::LendingClient;
pub use config::Config;
pub use error::{LendingError, RejectReason};
pub use services::{EncryptionPipeline, HttpOracle, Keyring, SettlementOracle, SimulatedLedger};
pub use state::{CollateralRegistry, LoanStateMachine};
