//! Shot Caller: admission control, metering and upstream credential rotation
//! for AI generation requests.

pub mod billing;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod providers;
pub mod registry;
pub mod security;
pub mod shotcaller;
pub mod strategy;
pub mod vault;

pub use config::Config;
pub use error::ShotCallerError;
pub use shotcaller::{GenerationResponse, InboundRequest, ShotCaller};
