//! cube-dispatch — the gateway dispatch and RPC-relay engine.
//!
//! Registers backend directors, pins each client session to one director
//! by weighted-random selection, relays envelopes (fire-and-forget,
//! tracked, blocking), routes inbound director envelopes, and reaps stale
//! state on a fixed period.

pub mod affinity;
pub mod director;
pub mod error;
pub mod performer;
pub mod presence;
pub mod reaper;
pub mod registry;
pub mod selector;
pub mod session;
pub mod stats;
pub mod telemetry;

pub use affinity::AffinityTable;
pub use director::{Director, Endpoint, Scope, Section, Speaker};
pub use error::DispatchError;
pub use performer::{Cellet, Performer, PerformerListener};
pub use presence::{Contact, Device, Presence};
pub use reaper::{Reaper, ReaperSettings, SweepSummary};
pub use registry::DirectorRegistry;
pub use selector::WeightedSelector;
pub use session::{Session, SessionId, SessionRef};
pub use stats::{PerformerStats, StatsSnapshot};
pub use telemetry::{LogBuffer, LogCapture, LogLine, Report, ReportSink};
