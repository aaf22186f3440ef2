//! Settlement Oracle Transport
//!
//! 레저(settlement oracle)에 도달하는 제출/조회 인터페이스.
//!
//! # Implementation Options
//!
//! 1. `HttpOracle`: settlement gateway JSON API (reqwest)
//! 2. `SimulatedLedger`: 프로세스 내 테스트/데모용 레저
//!
//! # Interview Q&A
//!
//! Q: 왜 클라이언트가 자동 재시도를 하지 않는가?
//! A: 금융 트랜잭션 중복 제출 방지
//!    - 타임아웃 시 트랜잭션이 이미 반영되었을 수 있음
//!    - `OracleUnreachable`만 호출자가 백오프로 재시도
//!    - 재시도 전에 확인된 상태를 재조회해야 함

use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{LendingError, RejectReason, Result};

/// 서명 주체가 붙은 제출 트랜잭션
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub from: Address,
    pub to: Address,
    pub nonce: u64,
    pub chain_id: u64,
    /// ABI 인코딩된 calldata (`0x` hex로 전송)
    pub data: Bytes,
    /// native value (payable 호출)
    pub value: U256,
}

/// 제출 확인 (acknowledgement)
///
/// 전이 확인은 항상 이 영수증에서 얻음 (이후 조회로 대체하지 않음)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: H256,
    pub block_number: u64,
    pub block_timestamp: u64,
    /// ABI 인코딩된 반환값
    pub output: Bytes,
}

/// Settlement oracle 접근 인터페이스
#[async_trait]
pub trait SettlementOracle: Send + Sync {
    /// 계정의 다음 논스
    async fn nonce(&self, account: Address) -> Result<u64>;

    /// 원자적 상태 전이 제출
    async fn submit(&self, tx: Transaction) -> Result<Receipt>;

    /// 읽기 전용 호출 (마지막으로 확인된 상태)
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes>;
}

// ============ HTTP gateway ============

/// 게이트웨이 응답
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum GatewayReply<T> {
    Accepted(T),
    Rejected { reason: String },
}

#[derive(Debug, Serialize)]
struct NonceRequest {
    account: Address,
}

#[derive(Debug, Deserialize)]
struct NonceReply {
    nonce: u64,
}

#[derive(Debug, Serialize)]
struct CallRequest {
    to: Address,
    data: Bytes,
}

#[derive(Debug, Deserialize)]
struct CallReply {
    output: Bytes,
}

/// Settlement gateway HTTP 클라이언트
///
/// # Endpoints
///
/// ```text
/// POST {base}/nonce   {account}                         -> {status, nonce}
/// POST {base}/submit  {from,to,nonce,chain_id,data,value} -> {status, tx_hash, block_number, block_timestamp, output}
/// POST {base}/call    {to, data}                        -> {status, output}
/// ```
///
/// 거절 응답: `{"status": "rejected", "reason": "stale nonce"}`
pub struct HttpOracle {
    base_url: String,
    client: reqwest::Client,
}

impl HttpOracle {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LendingError::OracleUnreachable(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| LendingError::OracleUnreachable(format!("{}: {}", url, e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(LendingError::OracleUnreachable(format!("{} returned {}", url, status)));
        }

        let text = response
            .text()
            .await
            .map_err(|e| LendingError::OracleUnreachable(format!("{}: {}", url, e)))?;

        parse_reply(path, &text)
    }
}

fn parse_reply<R: DeserializeOwned>(path: &str, text: &str) -> Result<R> {
    let reply: GatewayReply<R> = serde_json::from_str(text)
        .map_err(|e| LendingError::MalformedResponse(format!("{}: {}", path, e)))?;

    match reply {
        GatewayReply::Accepted(value) => Ok(value),
        GatewayReply::Rejected { reason } => {
            tracing::warn!(path, %reason, "gateway rejected request");
            Err(LendingError::rejected(RejectReason::from_reason(&reason)))
        }
    }
}

#[async_trait]
impl SettlementOracle for HttpOracle {
    async fn nonce(&self, account: Address) -> Result<u64> {
        let reply: NonceReply = self.post("nonce", &NonceRequest { account }).await?;
        Ok(reply.nonce)
    }

    async fn submit(&self, tx: Transaction) -> Result<Receipt> {
        self.post("submit", &tx).await
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let reply: CallReply = self.post("call", &CallRequest { to, data }).await?;
        Ok(reply.output)
    }
}
