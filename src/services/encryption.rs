//! Encryption Pipeline
//!
//! 평문 숫자 필드를 `(Ciphertext, Proof)` 쌍으로 변환
//!
//! # Pipeline
//!
//! ```text
//! Plaintext ──encode──▶ EncodedPlaintext ──encrypt──▶ Ciphertext ──prove──▶ Proof
//!  "8.50"                "8.5" (UTF-8)                 SHA-256(bytes)          SHA-256(ct)
//! ```
//!
//! # Interview Q&A
//!
//! Q: 왜 암호화를 해시로 대체했는가?
//! A: 인터페이스 형태만 고정하기 위해
//!    - 실제 FHE 스킴(덧셈/곱셈 동형)은 `EncryptionScheme` 뒤에 주입
//!    - 상태 머신과 레저 클라이언트는 스킴 교체와 무관
//!    - 해시는 결정적이므로 파이프라인 테스트가 가능
//!
//! Q: 증명은 어떻게 암호문에 묶이는가?
//! A: `Proof = SHA-256(Ciphertext)` 단방향 바인딩
//!    - 평문을 노출하지 않고 검증 가능
//!    - 제출마다 새로 계산 (캐시하지 않음)

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{LendingError, Result};
use crate::types::{from_prefixed_hex, to_prefixed_hex, MAX_ENCRYPTED_VALUE, RATE_SCALE};

// ============ Opaque byte types ============

/// 암호문 (불변, 키 보유자만 복호화)
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Ciphertext(Vec<u8>);

/// 암호문에 대한 증명
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Proof(Vec<u8>);

macro_rules! opaque_bytes {
    ($name:ident) => {
        impl $name {
            pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
                Self(bytes.into())
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                to_prefixed_hex(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.to_hex()
            }
        }

        impl TryFrom<String> for $name {
            type Error = hex::FromHexError;

            fn try_from(text: String) -> std::result::Result<Self, Self::Error> {
                from_prefixed_hex(&text).map(Self)
            }
        }
    };
}

opaque_bytes!(Ciphertext);
opaque_bytes!(Proof);

/// 제출 가능한 암호화 필드
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedField {
    pub ciphertext: Ciphertext,
    pub proof: Proof,
}

// ============ Plaintext encoding ============

/// 호출자가 입력한 평문 (문자열 또는 숫자)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plaintext {
    Text(String),
    Number(u64),
}

impl From<&str> for Plaintext {
    fn from(text: &str) -> Self {
        Plaintext::Text(text.to_string())
    }
}

impl From<String> for Plaintext {
    fn from(text: String) -> Self {
        Plaintext::Text(text)
    }
}

impl From<u64> for Plaintext {
    fn from(value: u64) -> Self {
        Plaintext::Number(value)
    }
}

impl From<u32> for Plaintext {
    fn from(value: u32) -> Self {
        Plaintext::Number(value as u64)
    }
}

/// 필드 종류 (숫자 해석 규칙)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// 0..=2^32-1 정수
    Amount,
    /// 퍼센트, 소수점 4자리까지 (RATE_SCALE 고정소수점)
    Rate,
}

impl FieldKind {
    fn scale(self) -> u64 {
        match self {
            FieldKind::Amount => 1,
            FieldKind::Rate => RATE_SCALE,
        }
    }

    fn fraction_digits(self) -> usize {
        match self {
            FieldKind::Amount => 0,
            FieldKind::Rate => 4,
        }
    }
}

/// 정규화된 평문 바이트 + 고정소수점 값
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPlaintext {
    pub kind: FieldKind,
    pub bytes: Vec<u8>,
    pub scaled: u64,
}

/// 평문을 정규 바이트 표현으로 직렬화
///
/// - 문자열: 정규화된 10진수의 UTF-8 ("040000" → "40000", "8.50" → "8.5")
/// - 숫자: 최소 big-endian (0 → `[0x00]`)
pub fn encode_field(plaintext: &Plaintext, kind: FieldKind) -> Result<EncodedPlaintext> {
    match plaintext {
        Plaintext::Text(text) => {
            let (canonical, scaled) = normalize_decimal(text, kind)?;
            Ok(EncodedPlaintext {
                kind,
                bytes: canonical.into_bytes(),
                scaled,
            })
        }
        Plaintext::Number(value) => {
            let scaled = value
                .checked_mul(kind.scale())
                .filter(|scaled| *scaled <= MAX_ENCRYPTED_VALUE)
                .ok_or_else(|| {
                    LendingError::EncodingError(format!("{} exceeds the encryptable range", value))
                })?;
            Ok(EncodedPlaintext {
                kind,
                bytes: minimal_be(*value),
                scaled,
            })
        }
    }
}

fn minimal_be(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(bytes.len() - 1);
    bytes[skip..].to_vec()
}

fn normalize_decimal(text: &str, kind: FieldKind) -> Result<(String, u64)> {
    let text = text.trim();
    let invalid = || LendingError::EncodingError(format!("{:?} is not a decimal number", text));

    let (int_part, frac_part) = match text.split_once('.') {
        Some((_, "")) => return Err(invalid()),
        Some((int_part, frac_part)) => (int_part, frac_part),
        None => (text, ""),
    };
    if int_part.is_empty()
        || !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(invalid());
    }

    let int_part = match int_part.trim_start_matches('0') {
        "" => "0",
        trimmed => trimmed,
    };
    let frac_part = frac_part.trim_end_matches('0');
    if frac_part.len() > kind.fraction_digits() {
        return Err(LendingError::EncodingError(format!(
            "{:?} has more than {} fractional digits",
            text,
            kind.fraction_digits()
        )));
    }

    let out_of_range =
        || LendingError::EncodingError(format!("{} exceeds the encryptable range", text));
    let int_value: u64 = int_part.parse().map_err(|_| out_of_range())?;
    let frac_value: u64 = if frac_part.is_empty() {
        0
    } else {
        let padded = format!("{:0<width$}", frac_part, width = kind.fraction_digits());
        padded.parse().map_err(|_| invalid())?
    };
    let scaled = int_value
        .checked_mul(kind.scale())
        .and_then(|v| v.checked_add(frac_value))
        .filter(|v| *v <= MAX_ENCRYPTED_VALUE)
        .ok_or_else(out_of_range)?;

    let canonical = if frac_part.is_empty() {
        int_part.to_string()
    } else {
        format!("{}.{}", int_part, frac_part)
    };
    Ok((canonical, scaled))
}

// ============ Encryption capability ============

/// 주입 가능한 암호화 스킴
///
/// 실제 동형 암호 구현은 이 트레이트 뒤에서 교체
pub trait EncryptionScheme: Send + Sync {
    fn encrypt(&self, plaintext: &EncodedPlaintext) -> Result<Ciphertext>;
    fn prove(&self, ciphertext: &Ciphertext) -> Result<Proof>;
}

fn digest(bytes: &[u8]) -> Vec<u8> {
    Sha256::digest(bytes).to_vec()
}

/// 증명 검증: `proof == SHA-256(ciphertext)`
pub fn verify_proof(ciphertext: &Ciphertext, proof: &Proof) -> bool {
    digest(ciphertext.as_bytes()) == proof.as_bytes()
}

/// SHA-256 대체 스킴 (상태 없음)
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Scheme;

impl EncryptionScheme for Sha256Scheme {
    fn encrypt(&self, plaintext: &EncodedPlaintext) -> Result<Ciphertext> {
        Ok(Ciphertext(digest(&plaintext.bytes)))
    }

    fn prove(&self, ciphertext: &Ciphertext) -> Result<Proof> {
        Ok(Proof(digest(ciphertext.as_bytes())))
    }
}

/// 시뮬레이션 키 보유자
///
/// SHA-256 스킴으로 암호화하면서 (필드 종류, 암호문) → 스케일 값을 기록.
/// 같은 바이트도 종류마다 값이 다르므로 (`8`: Amount 8, Rate 80000) 종류별로 보관.
/// 레저 측 비교 연산(동등성/임계값)은 이 키링을 통해 수행되며,
/// 클라이언트는 절대 복호화하지 않음.
#[derive(Debug)]
pub struct Keyring {
    entries: RwLock<HashMap<(FieldKind, Ciphertext), u64>>,
    open: AtomicBool,
}

impl Default for Keyring {
    fn default() -> Self {
        Self::new()
    }
}

impl Keyring {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            open: AtomicBool::new(true),
        }
    }

    /// 기대하는 필드 종류로 평가한 스케일 값
    pub fn decrypt(&self, ciphertext: &Ciphertext, kind: FieldKind) -> Option<u64> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(kind, ciphertext.clone()))
            .copied()
    }

    /// 키 보유자 종료 (이후 암호화 불가)
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(LendingError::EncryptionUnavailable("keyring is closed".to_string()))
        }
    }
}

impl EncryptionScheme for Keyring {
    fn encrypt(&self, plaintext: &EncodedPlaintext) -> Result<Ciphertext> {
        self.ensure_open()?;
        let ciphertext = Sha256Scheme.encrypt(plaintext)?;
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((plaintext.kind, ciphertext.clone()), plaintext.scaled);
        Ok(ciphertext)
    }

    fn prove(&self, ciphertext: &Ciphertext) -> Result<Proof> {
        self.ensure_open()?;
        Sha256Scheme.prove(ciphertext)
    }
}

/// 암호화 파이프라인
///
/// # Example
/// ```ignore
/// let pipeline = EncryptionPipeline::sha256();
/// let field = pipeline.encrypt_field(&"40000".into(), FieldKind::Amount)?;
/// assert!(verify_proof(&field.ciphertext, &field.proof));
/// ```
#[derive(Clone)]
pub struct EncryptionPipeline {
    scheme: Arc<dyn EncryptionScheme>,
}

impl EncryptionPipeline {
    pub fn new(scheme: Arc<dyn EncryptionScheme>) -> Self {
        Self { scheme }
    }

    pub fn sha256() -> Self {
        Self::new(Arc::new(Sha256Scheme))
    }

    /// 평문 필드 → (암호문, 증명)
    ///
    /// 재시도 없음: 순수 로컬 연산이며 재시도는 상위 계층 책임
    pub fn encrypt_field(&self, plaintext: &Plaintext, kind: FieldKind) -> Result<EncryptedField> {
        let encoded = encode_field(plaintext, kind)?;
        let ciphertext = self.scheme.encrypt(&encoded)?;
        let proof = self.scheme.prove(&ciphertext)?;
        tracing::debug!(?kind, ciphertext = %ciphertext.to_hex(), "field encrypted");
        Ok(EncryptedField { ciphertext, proof })
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    /// 암호화 범위 안의 금액
    fn amount() -> impl Strategy<Value = u64> {
        0..=MAX_ENCRYPTED_VALUE
    }

    /// 0 ~ 100% 이자율의 고정소수점 값
    fn rate_scaled() -> impl Strategy<Value = u64> {
        0..=100 * RATE_SCALE
    }

    fn rate_text(scaled: u64) -> String {
        format!("{}.{:04}", scaled / RATE_SCALE, scaled % RATE_SCALE)
    }

    proptest! {
        /// 같은 평문은 항상 같은 (암호문, 증명)
        #[test]
        fn encryption_is_deterministic(value in amount(), zeros in 0usize..4) {
            let pipeline = EncryptionPipeline::sha256();
            let text = format!("{}{}", "0".repeat(zeros), value);

            let a = pipeline.encrypt_field(&text.as_str().into(), FieldKind::Amount).unwrap();
            let b = pipeline.encrypt_field(&value.to_string().into(), FieldKind::Amount).unwrap();
            prop_assert_eq!(a, b);

            let n1 = pipeline.encrypt_field(&value.into(), FieldKind::Amount).unwrap();
            let n2 = pipeline.encrypt_field(&value.into(), FieldKind::Amount).unwrap();
            prop_assert_eq!(n1, n2);
        }

        /// 서로 다른 금액은 서로 다른 암호문 (문자열/숫자 표현 각각)
        #[test]
        fn distinct_amounts_never_collide(a in amount(), b in amount()) {
            prop_assume!(a != b);
            let pipeline = EncryptionPipeline::sha256();

            let text_a = pipeline.encrypt_field(&a.to_string().into(), FieldKind::Amount).unwrap();
            let text_b = pipeline.encrypt_field(&b.to_string().into(), FieldKind::Amount).unwrap();
            prop_assert_ne!(text_a.ciphertext, text_b.ciphertext);

            let num_a = pipeline.encrypt_field(&a.into(), FieldKind::Amount).unwrap();
            let num_b = pipeline.encrypt_field(&b.into(), FieldKind::Amount).unwrap();
            prop_assert_ne!(num_a.ciphertext, num_b.ciphertext);
        }

        /// 서로 다른 이자율은 서로 다른 암호문
        #[test]
        fn distinct_rates_never_collide(a in rate_scaled(), b in rate_scaled()) {
            prop_assume!(a != b);
            let pipeline = EncryptionPipeline::sha256();

            let field_a = pipeline.encrypt_field(&rate_text(a).into(), FieldKind::Rate).unwrap();
            let field_b = pipeline.encrypt_field(&rate_text(b).into(), FieldKind::Rate).unwrap();
            prop_assert_ne!(field_a.ciphertext, field_b.ciphertext);
        }

        /// proof == SHA-256(ciphertext), 다른 암호문에는 검증 실패
        #[test]
        fn proof_is_digest_of_ciphertext(value in amount(), scaled in rate_scaled()) {
            let pipeline = EncryptionPipeline::sha256();
            let principal = pipeline.encrypt_field(&value.into(), FieldKind::Amount).unwrap();
            let rate = pipeline.encrypt_field(&rate_text(scaled).into(), FieldKind::Rate).unwrap();

            for field in [&principal, &rate] {
                let digest = Sha256::digest(field.ciphertext.as_bytes());
                prop_assert_eq!(
                    field.proof.as_bytes(),
                    digest.as_slice()
                );
                prop_assert!(verify_proof(&field.ciphertext, &field.proof));
            }
            prop_assert!(!verify_proof(&principal.ciphertext, &rate.proof));
        }

        /// 키링은 기록한 종류로만 스케일 값을 돌려줌
        #[test]
        fn keyring_recovers_scaled_value(value in amount()) {
            let keyring = Arc::new(Keyring::new());
            let pipeline = EncryptionPipeline::new(keyring.clone());
            let field = pipeline.encrypt_field(&value.into(), FieldKind::Amount).unwrap();
            prop_assert_eq!(keyring.decrypt(&field.ciphertext, FieldKind::Amount), Some(value));
        }
    }
}
