//! # ghostcut-core - Migration control plane
//!
//! Shared state and decision logic for an online schema change: a shadow
//! ("ghost") table is filled by a row copier while a binlog applier replays
//! concurrent writes, and the tables are swapped at cut-over.
//!
//! ## Architecture
//!
//! ```text
//!   lag monitor   load poller   flag files   throttle query/HTTP
//!        │             │             │               │
//!        └─────────────┴──────┬──────┴───────────────┘
//!                             ▼
//!                    ┌─────────────────┐
//!                    │ThrottleEvaluator│     CriticalLoadBreaker
//!                    └────────┬────────┘            │
//!                             ▼                     ▼
//!  ┌──────────────────────────────────────────────────────────────┐
//!  │                  Arc<MigrationContext>                       │
//!  │ throttle verdict · load maps · retry policy · progress ·     │
//!  │ cut-over flags · point of interest · AbortHandle             │
//!  └──────────────────────────────────────────────────────────────┘
//!        ▲                  ▲                    │ fatal error
//!        │ is_throttled     │ retry_operation    ▼
//!   row copier          applier           AbortCoordinator ──▶ main
//! ```
//!
//! The [`AlterTableParser`] runs once at startup; its column renames and
//! drops are recorded on the context for the column-mapping logic.
//!
//! ## Quick Start
//!
//! ```rust
//! use ghostcut_core::{MigrationContext, ThrottleEvaluator, ThrottleObservations};
//! use std::collections::HashMap;
//!
//! let ctx = MigrationContext::new();
//! ctx.read_max_load("Threads_running=25").unwrap();
//!
//! let obs = ThrottleObservations {
//!     status_values: HashMap::from([("Threads_running".to_string(), 40)]),
//!     ..Default::default()
//! };
//! let verdict = ThrottleEvaluator::evaluate(&ctx, &obs);
//! assert!(verdict.should_throttle);
//! assert_eq!(ctx.is_throttled().1, "max-load Threads_running=40 >= 25");
//! ```

pub mod abort;
pub mod alter;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod instance_key;
pub mod load_map;
pub mod replication;
pub mod resilience;
pub mod throttle;
pub mod utils;

pub use abort::{abort_channel, AbortCoordinator, AbortHandle, AbortOutcome, AbortState};
pub use alter::AlterTableParser;
pub use config::FileConfig;
pub use connection::{validate_connection, ConnectionConfig, ServerProbe, TlsSettings};
pub use context::{CutOverType, MigrationContext, MigrationStatus, RowsEstimateMethod};
pub use error::{ErrorCategory, OscError, Result};
pub use instance_key::{InstanceKey, InstanceKeyMap};
pub use load_map::LoadMap;
pub use replication::{BinlogCoordinates, ReplicationLagResult};
pub use resilience::{
    retry_operation, retry_operation_with_exponential_backoff, ExponentialBackoff, Fatality,
};
pub use throttle::{
    check_panic_flag_file, CriticalLoadBreaker, CriticalLoadVerdict, HttpCheck,
    ThrottleCheckResult, ThrottleEvaluator, ThrottleObservations, ThrottleReasonHint,
};
