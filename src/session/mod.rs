// Session lifecycle module
// Session records, storage, security policy, recovery, background monitoring and the lifecycle manager

pub mod events;
pub mod locks;
pub mod manager;
pub mod monitor;
pub mod recovery;
pub mod security;
pub mod storage;
pub mod types;

pub use events::{BroadcastEventSink, EventSink, FanoutEventSink, SessionEvent, TracingEventSink};
pub use manager::{
    CreatedSession, DestroyAllOutcome, DestroyFailure, DestroyedSession, RecoveredSession,
    RenewOptions, RenewedSession, SessionLifecycleManager, SessionLifecycleManagerBuilder,
    SessionStats, ValidateOptions, ValidationOutcome,
};
pub use recovery::{IssuedRecoveryToken, RecoveryToken, RecoveryTokenState};
pub use security::{SecurityCheck, SecurityEvaluation, SecurityFinding, SecurityPolicyEngine, Severity};
pub use storage::{DurableStore, MemoryDurableStore, StorageError, StoreOptions};
pub use types::{
    DestroyReason, DeviceSignals, MetadataUpdate, RenewalTrigger, RequestContext, Session,
    SessionFlags, SessionInfo, SessionMetadata, SessionStatus, TokenProjection,
};
