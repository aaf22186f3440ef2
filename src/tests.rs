//! Lifecycle Integration Tests
//!
//! 여러 주체(차입자/대출자/청산자)가 하나의 SimulatedLedger를 공유하는 시나리오.
//! 취소/경합 테스트는 제출만 지연시키는 `SlowOracle` 래퍼 사용.

#[cfg(test)]
mod integration_tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use ethers::types::{Address, Bytes};
    use tokio_test::{assert_err, assert_ok};

    use crate::client::LendingClient;
    use crate::error::{LendingError, RejectReason, Result};
    use crate::services::{
        Ciphertext, EncodedPlaintext, EncryptionPipeline, EncryptionScheme, Keyring, LedgerConfig,
        Proof, Receipt, SettlementOracle, SimulatedLedger, Transaction, SIMULATED_CHAIN_ID,
        SIMULATED_CONTRACT,
    };
    use crate::state::{AssetPolicy, CollateralStatus, LendingPolicy, LoanStatus};
    use crate::types::{Amount, CollateralId, Identity, LoanId};

    const GENESIS: u64 = 1_700_000_000;
    const THIRTY_DAYS: i64 = 2_592_000;

    const BORROWER: u64 = 0xb0;
    const LENDER: u64 = 0x1e;
    const OTHER_LENDER: u64 = 0x2e;
    const LIQUIDATOR: u64 = 0x11;

    // =============================================================
    // Fixtures
    // =============================================================

    struct World {
        keyring: Arc<Keyring>,
        ledger: Arc<SimulatedLedger>,
    }

    impl World {
        fn new() -> Self {
            let keyring = Arc::new(Keyring::new());
            let ledger = Arc::new(SimulatedLedger::new(keyring.clone(), GENESIS));
            Self { keyring, ledger }
        }

        fn with_liquidator() -> Self {
            let keyring = Arc::new(Keyring::new());
            let ledger = SimulatedLedger::new(keyring.clone(), GENESIS)
                .with_liquidator(Address::from_low_u64_be(LIQUIDATOR));
            Self { keyring, ledger: Arc::new(ledger) }
        }

        fn client(&self, caller: u64) -> LendingClient<SimulatedLedger> {
            self.client_on(self.ledger.clone(), caller, LendingPolicy::default())
        }

        fn client_on<O: SettlementOracle>(
            &self,
            oracle: Arc<O>,
            caller: u64,
            policy: LendingPolicy,
        ) -> LendingClient<O> {
            LendingClient::new(
                EncryptionPipeline::new(self.keyring.clone()),
                oracle,
                ledger_config(caller),
                policy,
            )
        }

        fn slow(&self, delay: Duration, lands_first: bool) -> Arc<SlowOracle> {
            Arc::new(SlowOracle {
                inner: self.ledger.clone(),
                delay,
                lands_first,
                armed: AtomicBool::new(true),
            })
        }

        /// Scenario A 앞부분: 담보 1 등록 → 대출 1 신청
        async fn requested_loan(&self, borrower: &LendingClient<SimulatedLedger>) -> (CollateralId, LoanId) {
            let collateral = borrower
                .add_collateral("50000", "real_estate", "QmHash")
                .await
                .unwrap();
            let loan = borrower
                .create_loan(collateral, "40000", "8.5", THIRTY_DAYS)
                .await
                .unwrap();
            (collateral, loan)
        }
    }

    fn ledger_config(caller: u64) -> LedgerConfig {
        LedgerConfig {
            chain_id: SIMULATED_CHAIN_ID,
            contract: SIMULATED_CONTRACT,
            caller: Identity::from(Address::from_low_u64_be(caller)),
            ..Default::default()
        }
    }

    /// 제출만 지연시키는 오라클 래퍼
    ///
    /// `lands_first`: 레저 반영 후 지연 (결과가 취소 뒤에 도착하는 경우)
    /// `armed`가 꺼져 있으면 지연 없이 통과
    struct SlowOracle {
        inner: Arc<SimulatedLedger>,
        delay: Duration,
        lands_first: bool,
        armed: AtomicBool,
    }

    impl SlowOracle {
        fn set_armed(&self, armed: bool) {
            self.armed.store(armed, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SettlementOracle for SlowOracle {
        async fn nonce(&self, account: Address) -> Result<u64> {
            self.inner.nonce(account).await
        }

        async fn submit(&self, tx: Transaction) -> Result<Receipt> {
            if !self.armed.load(Ordering::SeqCst) {
                self.inner.submit(tx).await
            } else if self.lands_first {
                let receipt = self.inner.submit(tx).await;
                tokio::time::sleep(self.delay).await;
                receipt
            } else {
                tokio::time::sleep(self.delay).await;
                self.inner.submit(tx).await
            }
        }

        async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
            self.inner.call(to, data).await
        }
    }

    /// 암호문은 정상, 증명은 위조
    struct ForgedProofs(Arc<Keyring>);

    impl EncryptionScheme for ForgedProofs {
        fn encrypt(&self, plaintext: &EncodedPlaintext) -> Result<Ciphertext> {
            self.0.encrypt(plaintext)
        }

        fn prove(&self, _ciphertext: &Ciphertext) -> Result<Proof> {
            Ok(Proof::from_bytes(vec![0u8; 32]))
        }
    }

    // =============================================================
    // End-to-end Scenarios
    // =============================================================

    mod scenarios {
        use super::*;

        #[tokio::test]
        async fn test_scenario_a_full_lifecycle() {
            let world = World::new();
            let borrower = world.client(BORROWER);
            let lender = world.client(LENDER);

            let collateral = borrower
                .add_collateral("50000", "real_estate", "QmHash")
                .await
                .unwrap();
            assert_eq!(collateral, CollateralId(1));

            let loan_id = borrower
                .create_loan(collateral, "40000", "8.5", THIRTY_DAYS)
                .await
                .unwrap();
            assert_eq!(loan_id, LoanId(1));
            assert_eq!(borrower.loans().get(loan_id).unwrap().status, LoanStatus::Requested);

            let funded = lender.fund_loan(loan_id, "40000", Amount::zero()).await.unwrap();
            assert_eq!(funded.status, LoanStatus::Funded);
            let schedule = funded.schedule.unwrap();
            assert_eq!(schedule.start_time, GENESIS);
            assert_eq!(schedule.end_time, schedule.start_time + 2_592_000);
            assert_eq!(
                lender.collaterals().get(collateral).unwrap().status,
                CollateralStatus::Locked
            );

            let refreshed = borrower.refresh_loan(loan_id).await.unwrap();
            assert_eq!(refreshed, funded);

            let due = borrower.repayment_due("40000", "8.5").unwrap();
            assert_eq!(due, 43_400);
            let repaid = borrower.repay_loan(loan_id, "43400", Amount::zero()).await.unwrap();
            assert_eq!(repaid.status, LoanStatus::Repaid);

            assert_eq!(
                borrower.collaterals().get(collateral).unwrap().status,
                CollateralStatus::Released
            );
            assert_eq!(world.ledger.collateral_status(1), Some(CollateralStatus::Released));
            assert_eq!(world.ledger.loan_status(1), Some(LoanStatus::Repaid));
        }

        #[tokio::test]
        async fn test_scenario_b_fund_twice() {
            let world = World::new();
            let borrower = world.client(BORROWER);
            let lender = world.client(LENDER);
            let (_, loan_id) = world.requested_loan(&borrower).await;

            assert_ok!(lender.fund_loan(loan_id, "40000", Amount::zero()).await);
            assert_eq!(
                lender.fund_loan(loan_id, "40000", Amount::zero()).await.unwrap_err(),
                LendingError::AlreadyFunded(loan_id)
            );

            // 캐시가 없는 다른 대출자도 확인 상태를 읽고 로컬에서 거절
            let other = world.client(OTHER_LENDER);
            let before = world.ledger.submission_count();
            assert_eq!(
                other.fund_loan(loan_id, "40000", Amount::zero()).await.unwrap_err(),
                LendingError::AlreadyFunded(loan_id)
            );
            assert_eq!(world.ledger.submission_count(), before);
        }

        #[tokio::test]
        async fn test_scenario_c_locked_collateral() {
            let world = World::new();
            let borrower = world.client(BORROWER);
            let lender = world.client(LENDER);
            let (collateral, loan_id) = world.requested_loan(&borrower).await;
            assert_ok!(lender.fund_loan(loan_id, "40000", Amount::zero()).await);

            borrower.refresh_loan(loan_id).await.unwrap();
            assert_eq!(
                borrower.create_loan(collateral, "100", "1", 60).await.unwrap_err(),
                LendingError::CollateralNotAvailable(collateral)
            );

            // 캐시 없는 클라이언트도 레저의 Locked 상태로 거절
            let stranger = world.client(OTHER_LENDER);
            assert_eq!(
                stranger.create_loan(collateral, "100", "1", 60).await.unwrap_err(),
                LendingError::CollateralNotAvailable(collateral)
            );
        }

        #[tokio::test]
        async fn test_released_collateral_is_not_reusable() {
            let world = World::new();
            let borrower = world.client(BORROWER);
            let lender = world.client(LENDER);
            let (collateral, loan_id) = world.requested_loan(&borrower).await;
            assert_ok!(lender.fund_loan(loan_id, "40000", Amount::zero()).await);
            borrower.refresh_loan(loan_id).await.unwrap();
            assert_ok!(borrower.repay_loan(loan_id, 43_400u64, Amount::zero()).await);

            assert_eq!(
                borrower.create_loan(collateral, "100", "1", 60).await.unwrap_err(),
                LendingError::CollateralNotAvailable(collateral)
            );
        }

        #[tokio::test]
        async fn test_default_by_liquidator() {
            let world = World::with_liquidator();
            let borrower = world.client(BORROWER);
            let lender = world.client(LENDER);
            let liquidator = world.client(LIQUIDATOR);
            let (collateral, loan_id) = world.requested_loan(&borrower).await;
            let funded = lender.fund_loan(loan_id, "40000", Amount::zero()).await.unwrap();

            let err = liquidator.liquidate_loan(loan_id, world.ledger.now()).await.unwrap_err();
            assert!(matches!(err, LendingError::LoanNotDue { .. }));

            world.ledger.advance_time(2_592_001);
            let now = world.ledger.now();
            assert!(now > funded.end_time().unwrap());

            // 청산 권한 없는 계정은 레저가 거절, 확인 상태 유지
            let err = lender.liquidate_loan(loan_id, now).await.unwrap_err();
            assert_eq!(err, LendingError::rejected(RejectReason::Unauthorized));
            assert!(!lender.loans().is_stale(loan_id));
            assert_eq!(lender.loans().get(loan_id).unwrap().status, LoanStatus::Funded);

            let defaulted = liquidator.liquidate_loan(loan_id, now).await.unwrap();
            assert_eq!(defaulted.status, LoanStatus::Defaulted);
            assert_eq!(world.ledger.collateral_status(collateral.0), Some(CollateralStatus::Locked));

            // 종료 상태: 상환 불가
            borrower.refresh_loan(loan_id).await.unwrap();
            assert_eq!(
                borrower.repay_loan(loan_id, "43400", Amount::zero()).await.unwrap_err(),
                LendingError::NotFunded(loan_id)
            );
        }
    }

    // =============================================================
    // Policy & Validation
    // =============================================================

    mod policy_tests {
        use super::*;

        #[tokio::test]
        async fn test_self_funding_policy() {
            let world = World::new();
            let borrower = world.client(BORROWER);
            let (_, loan_id) = world.requested_loan(&borrower).await;

            assert_eq!(
                borrower.fund_loan(loan_id, "40000", Amount::zero()).await.unwrap_err(),
                LendingError::SelfFundingNotAllowed
            );

            let permissive = world.client_on(
                world.ledger.clone(),
                BORROWER,
                LendingPolicy { allow_self_funding: true, ..Default::default() },
            );
            let funded = permissive.fund_loan(loan_id, "40000", Amount::zero()).await.unwrap();
            assert_eq!(funded.lender, Some(funded.borrower));
        }

        #[tokio::test]
        async fn test_closed_asset_policy() {
            let world = World::new();
            let borrower = world.client_on(
                world.ledger.clone(),
                BORROWER,
                LendingPolicy { asset_types: AssetPolicy::standard(), ..Default::default() },
            );

            assert_eq!(
                borrower.add_collateral("10", "tulips", "Qm").await.unwrap_err(),
                LendingError::InvalidAssetType("tulips".to_string())
            );
            assert_eq!(world.ledger.submission_count(), 0);
            assert_ok!(borrower.add_collateral("10", "precious_metals", "Qm").await);
        }

        #[tokio::test]
        async fn test_invalid_inputs_never_submit() {
            let world = World::new();
            let borrower = world.client(BORROWER);
            let (collateral, _) = world.requested_loan(&borrower).await;
            let before = world.ledger.submission_count();

            let err = borrower.create_loan(collateral, "1", "1", 0).await.unwrap_err();
            assert_eq!(err, LendingError::InvalidDuration(0));
            let err = borrower.create_loan(collateral, "1", "8.123456", 60).await.unwrap_err();
            assert!(matches!(err, LendingError::EncodingError(_)));
            assert!(err.is_local() && !err.is_retryable());

            assert_eq!(world.ledger.submission_count(), before);
        }

        #[tokio::test]
        async fn test_repay_wrong_amount_rejected_by_ledger() {
            let world = World::new();
            let borrower = world.client(BORROWER);
            let lender = world.client(LENDER);
            let (_, loan_id) = world.requested_loan(&borrower).await;
            assert_ok!(lender.fund_loan(loan_id, "40000", Amount::zero()).await);
            borrower.refresh_loan(loan_id).await.unwrap();

            // 원금만 상환 → 레저의 암호문 비교에서 거절
            let err = borrower.repay_loan(loan_id, "40000", Amount::zero()).await.unwrap_err();
            assert!(matches!(
                err,
                LendingError::SubmissionRejected { reason: RejectReason::Reverted(_) }
            ));
            assert!(!err.permits_resubmit());
            assert_eq!(world.ledger.loan_status(1), Some(LoanStatus::Funded));
            assert_eq!(borrower.loans().get(loan_id).unwrap().status, LoanStatus::Funded);
        }

        #[tokio::test]
        async fn test_forged_proof_rejected() {
            let world = World::new();
            let forger = LendingClient::new(
                EncryptionPipeline::new(Arc::new(ForgedProofs(world.keyring.clone()))),
                world.ledger.clone(),
                ledger_config(BORROWER),
                LendingPolicy::default(),
            );

            let err = forger.add_collateral("50000", "real_estate", "Qm").await.unwrap_err();
            assert_eq!(err, LendingError::rejected(RejectReason::MalformedProof));
            assert!(forger.collaterals().ids().is_empty());
        }

        #[tokio::test]
        async fn test_closed_keyring_is_local_failure() {
            let world = World::new();
            let borrower = world.client(BORROWER);
            world.keyring.close();

            let err = borrower.add_collateral("1", "other", "Qm").await.unwrap_err();
            assert!(matches!(err, LendingError::EncryptionUnavailable(_)));
            assert_eq!(world.ledger.submission_count(), 0);
        }
    }

    // =============================================================
    // Remote Failures & Reconciliation
    // =============================================================

    mod reconciliation_tests {
        use super::*;

        #[tokio::test]
        async fn test_stale_nonce_allows_single_resubmit() {
            let world = World::new();
            let first = world.client(BORROWER);
            let second = world.client(BORROWER);

            assert_ok!(first.add_collateral("1", "other", "Qm1").await);
            assert_ok!(second.add_collateral("2", "other", "Qm2").await);

            let err = first.add_collateral("3", "other", "Qm3").await.unwrap_err();
            assert!(err.permits_resubmit());
            assert!(!err.is_retryable());

            let id = first.add_collateral("3", "other", "Qm3").await.unwrap();
            assert_eq!(id, CollateralId(3));
        }

        #[tokio::test]
        async fn test_unreachable_marks_for_reconciliation() {
            let world = World::new();
            let borrower = world.client(BORROWER);
            let collateral = borrower.add_collateral("50000", "real_estate", "Qm").await.unwrap();

            world.ledger.set_reachable(false);
            let err = borrower.create_loan(collateral, "40000", "8.5", THIRTY_DAYS).await.unwrap_err();
            assert!(err.is_retryable());
            assert!(borrower.collaterals().is_stale(collateral));
            assert!(!borrower.collaterals().view(collateral).unwrap().is_pending());

            world.ledger.set_reachable(true);
            let loan_id = borrower
                .create_loan(collateral, "40000", "8.5", THIRTY_DAYS)
                .await
                .unwrap();
            assert_eq!(loan_id, LoanId(1));
            assert!(!borrower.collaterals().is_stale(collateral));
        }

        #[tokio::test]
        async fn test_cancelled_before_landing() {
            let world = World::new();
            let borrower = world.client(BORROWER);
            let (collateral, loan_id) = world.requested_loan(&borrower).await;

            let slow = world.slow(Duration::from_millis(200), false);
            let lender = world
                .client_on(slow, LENDER, LendingPolicy::default())
                .with_timeout(Duration::from_millis(50));

            let err = lender.fund_loan(loan_id, "40000", Amount::zero()).await.unwrap_err();
            assert_eq!(err, LendingError::Cancelled { after: Duration::from_millis(50) });

            // overlay는 지워지고 재조회 대상으로 표시
            let view = lender.loans().view(loan_id).unwrap();
            assert!(!view.is_pending());
            assert_eq!(view.confirmed().status, LoanStatus::Requested);
            assert!(lender.loans().is_stale(loan_id));
            assert!(lender.collaterals().is_stale(collateral));

            tokio::time::sleep(Duration::from_millis(250)).await;
            assert_eq!(world.ledger.loan_status(loan_id.0), Some(LoanStatus::Requested));

            let reconciled = lender.refresh_loan(loan_id).await.unwrap();
            assert_eq!(reconciled.status, LoanStatus::Requested);
            assert!(!lender.loans().is_stale(loan_id));
        }

        #[tokio::test]
        async fn test_cancelled_after_landing_reconciles() {
            let world = World::new();
            let borrower = world.client(BORROWER);
            let (collateral, loan_id) = world.requested_loan(&borrower).await;

            let slow = world.slow(Duration::from_millis(200), true);
            let lender = world
                .client_on(slow, LENDER, LendingPolicy::default())
                .with_timeout(Duration::from_millis(50));

            assert_err!(lender.fund_loan(loan_id, "40000", Amount::zero()).await);
            assert_eq!(world.ledger.loan_status(loan_id.0), Some(LoanStatus::Funded));

            // 캐시는 여전히 Requested지만 stale → 다음 전이 전에 재조회
            assert_eq!(lender.loans().get(loan_id).unwrap().status, LoanStatus::Requested);
            assert_eq!(
                lender.fund_loan(loan_id, "40000", Amount::zero()).await.unwrap_err(),
                LendingError::AlreadyFunded(loan_id)
            );
            assert_eq!(
                lender.collaterals().get(collateral).unwrap().status,
                CollateralStatus::Locked
            );
        }

        #[tokio::test]
        async fn test_cancelled_after_landing_refetches_nonce() {
            let world = World::new();
            let borrower = world.client(BORROWER);
            let (_, loan_id) = world.requested_loan(&borrower).await;

            let slow = world.slow(Duration::from_millis(200), true);
            let lender = world
                .client_on(slow.clone(), LENDER, LendingPolicy::default())
                .with_timeout(Duration::from_millis(50));

            // 논스 캐시 채우기
            slow.set_armed(false);
            assert_eq!(lender.add_collateral("9", "other", "QmA").await.unwrap(), CollateralId(2));
            slow.set_armed(true);

            let err = lender.fund_loan(loan_id, "40000", Amount::zero()).await.unwrap_err();
            assert_eq!(err, LendingError::Cancelled { after: Duration::from_millis(50) });
            assert_eq!(world.ledger.loan_status(loan_id.0), Some(LoanStatus::Funded));

            // 관련 없는 다음 제출은 논스를 재조회해서 한 번에 성공
            slow.set_armed(false);
            let before = world.ledger.submission_count();
            let next = lender.add_collateral("9", "other", "QmB").await.unwrap();
            assert_eq!(next, CollateralId(3));
            assert_eq!(world.ledger.submission_count(), before + 1);
        }

        #[tokio::test]
        async fn test_cancelled_create_after_landing_keeps_reservation() {
            let world = World::new();
            let slow = world.slow(Duration::from_millis(200), true);
            let borrower = world
                .client_on(slow.clone(), BORROWER, LendingPolicy::default())
                .with_timeout(Duration::from_millis(50));

            slow.set_armed(false);
            let collateral = borrower.add_collateral("50000", "real_estate", "Qm").await.unwrap();
            slow.set_armed(true);

            let err = borrower
                .create_loan(collateral, "40000", "8.5", THIRTY_DAYS)
                .await
                .unwrap_err();
            assert_eq!(err, LendingError::Cancelled { after: Duration::from_millis(50) });
            assert_eq!(world.ledger.loan_status(1), Some(LoanStatus::Requested));
            assert!(borrower.collaterals().is_stale(collateral));

            // 재조회로 레저의 점유 대출이 드러남
            slow.set_armed(false);
            let refreshed = borrower.collaterals().refresh(collateral).await.unwrap();
            assert_eq!(refreshed.status, CollateralStatus::Registered);
            assert_eq!(refreshed.active_loan, Some(LoanId(1)));

            // 두 번째 신청은 제출 없이 로컬에서 거절
            let before = world.ledger.submission_count();
            assert_eq!(
                borrower.create_loan(collateral, "100", "1", 60).await.unwrap_err(),
                LendingError::CollateralNotAvailable(collateral)
            );
            assert_eq!(world.ledger.submission_count(), before);
        }

        #[tokio::test]
        async fn test_cancelled_create_rejected_without_refresh() {
            let world = World::new();
            let slow = world.slow(Duration::from_millis(200), true);
            let borrower = world
                .client_on(slow.clone(), BORROWER, LendingPolicy::default())
                .with_timeout(Duration::from_millis(50));

            slow.set_armed(false);
            let collateral = borrower.add_collateral("50000", "real_estate", "Qm").await.unwrap();
            slow.set_armed(true);
            assert_err!(borrower.create_loan(collateral, "40000", "8.5", THIRTY_DAYS).await);

            // stale 담보는 다음 전이 전에 재조회됨
            slow.set_armed(false);
            let before = world.ledger.submission_count();
            assert_eq!(
                borrower.create_loan(collateral, "100", "1", 60).await.unwrap_err(),
                LendingError::CollateralNotAvailable(collateral)
            );
            assert_eq!(world.ledger.submission_count(), before);
        }

        #[tokio::test]
        async fn test_same_id_transitions_are_serialized() {
            let world = World::new();
            let borrower = world.client(BORROWER);
            let (_, loan_id) = world.requested_loan(&borrower).await;

            let slow = world.slow(Duration::from_millis(50), false);
            let lender = world.client_on(slow, LENDER, LendingPolicy::default());
            let before = world.ledger.submission_count();

            let (first, second) = tokio::join!(
                lender.fund_loan(loan_id, "40000", Amount::zero()),
                lender.fund_loan(loan_id, "40000", Amount::zero()),
            );

            let results = [first, second];
            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
            assert!(results
                .iter()
                .any(|r| r.as_ref().err() == Some(&LendingError::AlreadyFunded(loan_id))));
            assert_eq!(world.ledger.submission_count(), before + 1);
        }
    }
}
