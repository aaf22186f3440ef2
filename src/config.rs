//! Configuration Module
//!
//! # Interview Q&A
//!
//! Q: 환경변수 vs 설정 파일, 어떤 방식을 선택했고 왜인가?
//! A: 환경변수를 선택
//!    - 12-Factor App 원칙 준수
//!    - 호출 주체(identity)와 endpoint는 외부 협력자가 주입
//!    - 키 자료를 코드/파일에 포함하지 않음
//!
//! Q: 설정 검증은 어떻게 하는가?
//! A: from_env()에서 모든 값 파싱 → 잘못된 값은 즉시 실패 (fail-fast)

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use ethers::types::Address;

use crate::services::LedgerConfig;
use crate::state::{AssetPolicy, LendingPolicy};
use crate::types::Identity;

/// 애플리케이션 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// Settlement gateway URL
    pub oracle_url: String,

    /// Chain ID (기본값: 31337, Anvil)
    pub chain_id: u64,

    /// Lending contract 주소
    pub contract: Address,

    /// 호출 주체
    pub caller: Identity,

    /// 청산 권한 계정 (데모 레저용)
    pub liquidator: Option<Identity>,

    /// 호출 기한 (기본값: 30초)
    pub submission_timeout: Duration,

    /// 자산 종류 정책 (미설정 시 open)
    pub asset_types: AssetPolicy,

    /// 차입자 == 대출자 허용 여부
    pub allow_self_funding: bool,

    /// 환경 (development, staging, production)
    pub environment: Environment,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            oracle_url: "http://localhost:8545".to_string(),
            chain_id: 31337,
            contract: Address::zero(),
            caller: Identity::from(Address::zero()),
            liquidator: None,
            submission_timeout: Duration::from_secs(30),
            asset_types: AssetPolicy::Open,
            allow_self_funding: false,
            environment: Environment::Development,
        }
    }
}

impl Config {
    /// 환경변수에서 설정 로드
    ///
    /// # Optional Environment Variables
    ///
    /// - `ORACLE_URL`: settlement gateway (기본값: http://localhost:8545)
    /// - `CHAIN_ID`: chain id (기본값: 31337)
    /// - `CONTRACT_ADDRESS`: lending contract 주소
    /// - `CALLER_ADDRESS`: 호출 주체 주소
    /// - `LIQUIDATOR_ADDRESS`: 청산 권한 계정
    /// - `SUBMISSION_TIMEOUT_SECS`: 호출 기한 (기본값: 30)
    /// - `ASSET_TYPES`: 쉼표 구분 자산 태그 목록 (설정 시 closed 정책)
    /// - `ALLOW_SELF_FUNDING`: true | false (기본값: false)
    /// - `ENVIRONMENT`: development | staging | production
    pub fn from_env() -> Result<Self> {
        let environment = match env::var("ENVIRONMENT")
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
            .as_str()
        {
            "production" => Environment::Production,
            "staging" => Environment::Staging,
            _ => Environment::Development,
        };

        Ok(Config {
            oracle_url: env::var("ORACLE_URL")
                .unwrap_or_else(|_| "http://localhost:8545".to_string()),

            chain_id: env::var("CHAIN_ID")
                .unwrap_or_else(|_| "31337".to_string())
                .parse()
                .context("CHAIN_ID must be a valid number")?,

            contract: optional_identity("CONTRACT_ADDRESS")?
                .map(|identity| identity.address())
                .unwrap_or_else(Address::zero),

            caller: optional_identity("CALLER_ADDRESS")?
                .unwrap_or_else(|| Identity::from(Address::zero())),

            liquidator: optional_identity("LIQUIDATOR_ADDRESS")?,

            submission_timeout: Duration::from_secs(
                env::var("SUBMISSION_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .context("SUBMISSION_TIMEOUT_SECS must be a valid number")?,
            ),

            asset_types: env::var("ASSET_TYPES")
                .map(|list| parse_asset_types(&list))
                .unwrap_or_default(),

            allow_self_funding: env::var("ALLOW_SELF_FUNDING")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .context("ALLOW_SELF_FUNDING must be true or false")?,

            environment,
        })
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            oracle_url: self.oracle_url.clone(),
            chain_id: self.chain_id,
            contract: self.contract,
            caller: self.caller,
        }
    }

    pub fn policy(&self) -> LendingPolicy {
        LendingPolicy {
            asset_types: self.asset_types.clone(),
            allow_self_funding: self.allow_self_funding,
        }
    }

    /// 프로덕션 환경인지 확인
    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }
}

fn optional_identity(var: &str) -> Result<Option<Identity>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Identity::new(&value)
            .map(Some)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("{} must be a 0x-prefixed address", var)),
        _ => Ok(None),
    }
}

/// "real_estate, artwork" → closed 정책 (빈 목록이면 open)
fn parse_asset_types(list: &str) -> AssetPolicy {
    let tags: Vec<&str> = list.split(',').map(str::trim).filter(|tag| !tag.is_empty()).collect();
    if tags.is_empty() {
        AssetPolicy::Open
    } else {
        AssetPolicy::closed(tags)
    }
}
