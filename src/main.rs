//! Vault Loan Shield demo
//!
//! ```text
//! LOAN_ID 미설정: SimulatedLedger 위에서 전체 생명주기 실행
//!   borrower: addCollateral → createLoan
//!   lender:   fundLoan
//!   borrower: repayLoan
//!
//! LOAN_ID 설정:  ORACLE_URL 게이트웨이에서 해당 대출 조회
//! ```

use std::sync::Arc;

use anyhow::Context;
use ethers::types::Address;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vault_loan_shield::{
    config::Config,
    services::{LedgerConfig, SIMULATED_CHAIN_ID, SIMULATED_CONTRACT},
    types::{Amount, Identity, LoanId},
    EncryptionPipeline, Keyring, LendingClient, SimulatedLedger,
};

/// 1,700,000,000 (2023-11-14) 기준 시뮬레이션 시계
const GENESIS_TIME: u64 = 1_700_000_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 환경변수 로드
    dotenvy::dotenv().ok();

    // 로깅 초기화
    // RUST_LOG=vault_loan_shield=info 형태로 레벨 제어 가능
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "vault_loan_shield=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!(environment = ?config.environment, "configuration loaded");

    match std::env::var("LOAN_ID") {
        Ok(id) => {
            let loan_id = LoanId(id.parse().context("LOAN_ID must be a valid number")?);
            inspect_loan(&config, loan_id).await
        }
        Err(_) => run_simulation(&config).await,
    }
}

/// 게이트웨이에서 확인된 대출 상태 조회
async fn inspect_loan(config: &Config, loan_id: LoanId) -> anyhow::Result<()> {
    let client = LendingClient::from_config(config, EncryptionPipeline::sha256())?;
    tracing::info!(url = %config.oracle_url, "settlement gateway client ready");

    let loan = client.refresh_loan(loan_id).await?;
    println!("{} status={:?} borrower={}", loan.id, loan.status, loan.borrower);
    if let Some(lender) = loan.lender {
        println!("  lender={}", lender);
    }
    if let Some(schedule) = loan.schedule {
        println!("  start={} end={}", schedule.start_time, schedule.end_time);
    }
    println!("  principal={}", loan.encrypted_principal.to_hex());

    client.shutdown();
    Ok(())
}

/// 프로세스 내 레저로 대출 생명주기 실행
async fn run_simulation(config: &Config) -> anyhow::Result<()> {
    let keyring = Arc::new(Keyring::new());
    let mut ledger = SimulatedLedger::new(keyring.clone(), GENESIS_TIME);
    if let Some(liquidator) = config.liquidator {
        ledger = ledger.with_liquidator(liquidator.address());
    }
    let ledger = Arc::new(ledger);
    tracing::info!("simulated settlement ledger started");

    let party = |caller: u64| {
        LendingClient::new(
            EncryptionPipeline::new(keyring.clone()),
            ledger.clone(),
            LedgerConfig {
                chain_id: SIMULATED_CHAIN_ID,
                contract: SIMULATED_CONTRACT,
                caller: Identity::from(Address::from_low_u64_be(caller)),
                ..Default::default()
            },
            config.policy(),
        )
        .with_timeout(config.submission_timeout)
    };
    let borrower = party(0xb0);
    let lender = party(0x1e);

    let collateral = borrower.add_collateral("50000", "real_estate", "QmPropertyDeed").await?;
    let loan_id = borrower.create_loan(collateral, "40000", "8.5", 2_592_000).await?;
    println!("{} requested against {}", loan_id, collateral);

    let funded = lender.fund_loan(loan_id, "40000", Amount::eth(0)).await?;
    if let Some(schedule) = funded.schedule {
        println!("{} funded: {} → {}", loan_id, schedule.start_time, schedule.end_time);
    }

    // 대출자의 전이는 차입자 캐시에 재조회로만 반영
    ledger.advance_time(86_400);
    borrower.refresh_loan(loan_id).await?;
    let due = borrower.repayment_due("40000", "8.5")?;
    let repaid = borrower.repay_loan(loan_id, due, Amount::eth(0)).await?;
    println!("{} repaid ({} due), status={:?}", loan_id, due, repaid.status);

    let collateral_status = borrower
        .collaterals()
        .get(collateral)
        .map(|record| record.status);
    println!("{} status={:?}", collateral, collateral_status);

    if config.is_production() {
        tracing::warn!("simulation mode should not be used in production");
    }

    borrower.shutdown();
    lender.shutdown();
    Ok(())
}
