//! Continuous test execution engine.
//!
//! Decides which tests need to run after a change, runs one batch at a time
//! on a dedicated worker and keeps cross-run results for listeners and
//! tooling. Test discovery and execution are supplied by the host through
//! [`DiscoveryProvider`] and [`ExecutionProbe`].

pub mod aggregate;
pub mod config;
pub mod coordinator;
pub mod executor;
pub mod listener;
pub mod model;
pub mod normalize;
pub mod selection;
pub mod session;
pub mod store;

pub use aggregate::{ClassResult, ResultAggregate};
pub use config::{ConfigError, FilterSettings, TestConfig};
pub use coordinator::{BatchRunner, Phase, RunCoordinator, RunStatus};
pub use executor::filter::DescriptorFilter;
pub use executor::probe::{
    CancellationToken, Discovery, DiscoveryProvider, ExecutionEvents, ExecutionProbe, ProbeError, TestOutcome,
    TestPlan,
};
pub use executor::{BatchOutcome, ExecutionError, ExtraFilter, RunExecutor};
pub use listener::{ListenerSet, TestListener};
pub use model::{ChangeSet, DescriptorKind, IdParseError, RunRequest, TestDescriptor, TestId, TestResult, TestStatus};
pub use selection::{ChangeFeed, Selection, UsageIndex, WatchError, WatcherConfig};
pub use session::{SessionError, SessionState, TestSession};
pub use store::{ResultStore, ResultsByClass};
