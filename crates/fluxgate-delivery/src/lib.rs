//! Multi-tenant event delivery pipeline.
//!
//! Ingests normalized events, reshapes them per tenant-configured
//! integrations, and delivers them to HTTP endpoints or communication
//! channels with rate limiting, intra-request retries, dead-lettering and
//! step-level execution logs. Deferred deliveries run through a sandboxed
//! scheduling script and a background worker.

pub mod auth;
pub mod config;
pub mod dlq;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod logger;
pub mod pending;
pub mod pipeline;
pub mod rate_limit;
pub mod retry;
pub mod router;
pub mod scheduler;
pub mod transform;
pub mod worker;

pub use auth::{AuthHeaderBuilder, TokenCacheKey};
pub use config::{
    Action, ActionTarget, AuthConfig, DeliveryMode, Direction, FieldMapping, HttpMethod,
    InMemoryIntegrationStore, IntegrationConfig, IntegrationStore, RateLimitSettings,
    RetrySettings, TransformSpec,
};
pub use dlq::{
    BulkOutcome, DlqEntry, DlqFilter, DlqService, DlqStatus, DlqStore, InMemoryDlqStore,
    Redeliver,
};
pub use error::ApiError;
pub use executor::{
    BufferedResponse, ChannelProvider, DeliveryExecutor, ProviderRegistry, StreamingStart,
};
pub use logger::{
    AttemptStatus, ExecutionLog, ExecutionLogStore, ExecutionLogger, InMemoryLogStore,
    StepStatus,
};
pub use pending::{
    InMemoryPendingStore, PendingDelivery, PendingDeliveryStore, PendingStatus,
};
pub use pipeline::{
    AttemptOutcome, DeliveryPipeline, EventIntake, IngestDisposition, ReplayError,
    STREAMED_BODY_MARKER,
};
pub use rate_limit::{
    InMemoryCounterStore, RateLimitCounterStore, RateLimitDecision, RateLimiter,
};
pub use retry::RetryPolicy;
pub use router::{gateway_router, GatewayState};
pub use scheduler::{RecurringConfig, ScheduleOutcome, SchedulePreview, Scheduler};
pub use transform::{ResponseContext, TransformContext, Transformer};
pub use worker::{DeliveryWorker, WorkerConfig};
