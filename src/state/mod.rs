//! Client-side State
//!
//! 레저가 소유한 레코드의 read-through 캐시와 전이 규칙
//!
//! # Components
//! - `CollateralRegistry`: 담보 등록/투영
//! - `LoanStateMachine`: 대출 생명주기 전이
//! - `Overlay`: 확인 상태 + 대기 중인 전이 (`Tracked<T>`)

mod loans;
mod models;
mod overlay;
mod registry;

pub use loans::LoanStateMachine;
pub use models::{
    AssetPolicy, AssetType, CollateralRecord, CollateralStatus, LendingPolicy, LoanRecord,
    LoanSchedule, LoanStatus,
};
pub use overlay::{IdLocks, Overlay, PendingGuard, Tracked};
pub use registry::{CollateralGuard, CollateralRegistry};
