//! Report-once telemetry flags and tracing setup.

use crate::error::{LifecycleError, Result};
use crate::types::Address;
use std::collections::HashSet;
use std::fmt;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Metrics reported at most once per subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelemetryEvent {
    /// Account state loaded for the first time
    AccountLoaded,
    /// Account has recovery modules enabled
    RecoveryModulesDetected,
    /// A recovery proposal reached the on-chain queue
    RecoveryProposed,
}

impl fmt::Display for TelemetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TelemetryEvent::AccountLoaded => "account_loaded",
            TelemetryEvent::RecoveryModulesDetected => "recovery_modules_detected",
            TelemetryEvent::RecoveryProposed => "recovery_proposed",
        };
        f.write_str(name)
    }
}

/// Tracks which `(event, subject)` pairs were already reported.
///
/// Flags live as long as the owning value and are cleared when the connected
/// wallet changes.
#[derive(Debug, Default)]
pub struct ReportOnce {
    wallet: Option<Address>,
    reported: HashSet<(TelemetryEvent, String)>,
}

impl ReportOnce {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the connected wallet; a different wallet resets every flag.
    ///
    /// Returns `true` if the flags were reset.
    pub fn set_wallet(&mut self, wallet: Option<Address>) -> bool {
        if self.wallet == wallet {
            return false;
        }
        self.wallet = wallet;
        self.reset();
        true
    }

    /// Report `event` for `subject` unless already reported; returns `true`
    /// on the first report
    pub fn report(&mut self, event: TelemetryEvent, subject: &impl fmt::Display) -> bool {
        let subject = subject.to_string();
        if !self.reported.insert((event, subject.clone())) {
            return false;
        }

        info!(target: "safe_lifecycle::telemetry", %event, %subject, "telemetry");
        true
    }

    /// Whether `event` was already reported for `subject`
    pub fn is_reported(&self, event: TelemetryEvent, subject: &impl fmt::Display) -> bool {
        self.reported.contains(&(event, subject.to_string()))
    }

    /// Clear every flag
    pub fn reset(&mut self) {
        self.reported.clear();
    }
}

/// Install a `fmt` subscriber honouring `RUST_LOG`, falling back to
/// `default_filter`
pub fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| LifecycleError::ConfigError(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| LifecycleError::ConfigError(format!("Tracing already initialised: {}", e)))
}
