//! Request engine: the parts that coordinate demand against scarce,
//! quota-bearing resources.
//!
//! - key pool with freeze/evict/daily-reset lifecycle
//! - admission-controlled FIFO scheduling
//! - HTTP/2 session management with keep-alive
//! - retry classification and credential rotation
//! - batch fan-out/fan-in planning

pub mod batch;
pub mod connection;
pub mod key_pool;
pub mod retry;
pub mod scheduler;
pub mod transport;

pub use batch::{format_targets, BatchPlan, BatchResponse, Targets, TargetSpec};
pub use connection::{ConnectionManager, Http2Session};
pub use key_pool::{KeyPool, KeyPoolStats, Release, DEFAULT_FREEZE};
pub use retry::{Classifier, FreezeVerdict, RetryDecision, RetryDriver, FAST_RETRY_DELAY};
pub use scheduler::Scheduler;
pub use transport::{
    AttemptOutcome, AttemptTiming, GatewayResponse, Http2Transport, RequestOptions, ResponseBody,
    Timing, Transport, NO_RESPONSE,
};
