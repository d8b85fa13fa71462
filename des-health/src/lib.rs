pub mod checker;

pub use checker::{
    HealthChecker, HealthChecks, HealthReport, OverallStatus, ProbeResult, ProbeStatus,
    ShardLockProbe, SourceProvidersProbe,
};
