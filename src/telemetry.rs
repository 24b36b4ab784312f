//! Structured reports for protocol violations.
//!
//! Components that detect something wrong (a chunk that cannot belong to its wrapper, two peers
//! disagreeing on a frame hash, a peer sending more commands than it announced) build a
//! [`ProtocolViolation`] and hand it to a [`ViolationObserver`]. Without an observer the report
//! goes to `tracing`.
//!
//! Violations are reported in addition to the component's own events. Events drive the
//! caller's logic; violations are for logs, dashboards and desync dumps.
//!
//! # Example
//!
//! ```
//! use fortress_lockstep::telemetry::{CollectingObserver, ViolationKind};
//! use fortress_lockstep::{DeterministicStateKernel, Frame, PlayerId};
//! use std::sync::Arc;
//!
//! let observer = Arc::new(CollectingObserver::new());
//! let mut kernel = DeterministicStateKernel::new().with_observer(observer.clone());
//!
//! kernel.record_local_frame_hash(Frame::new(3), 0xAAAA).unwrap();
//! kernel.record_remote_frame_hash(Frame::new(3), PlayerId::new(1), 0xBBBB).unwrap();
//!
//! assert!(observer.has_violation(ViolationKind::DigestMismatch));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Serialize, Serializer};

use crate::Frame;

/// How bad a violation is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// The offending input was dropped and the match continues.
    Warning,
    /// Peers can no longer be trusted to agree.
    Error,
    /// Local state is suspect.
    Critical,
}

impl ViolationSeverity {
    /// Label used in log fields.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The subsystem that detected a violation.
///
/// Marked `#[non_exhaustive]`; match with a wildcard arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Malformed wrapper chunks or undecodable commands.
    WireFormat,
    /// More commands arrived for a frame than the sender announced.
    FrameReadiness,
    /// A remote frame hash or logic CRC differs from the local one.
    DigestMismatch,
    /// Votes, disconnect frames or router re-election went somewhere unexpected.
    Disconnect,
    /// A configuration value was rejected.
    Configuration,
    /// A bookkeeping structure reached a state it should never reach.
    InternalError,
}

impl ViolationKind {
    /// Label used in log fields.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::WireFormat => "wire_format",
            Self::FrameReadiness => "frame_readiness",
            Self::DigestMismatch => "digest_mismatch",
            Self::Disconnect => "disconnect",
            Self::Configuration => "configuration",
            Self::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializes a null frame the same way as an absent one.
#[allow(clippy::ref_option)]
fn serialize_frame<S: Serializer>(frame: &Option<Frame>, serializer: S) -> Result<S::Ok, S::Error> {
    match frame.filter(|f| !f.is_null()) {
        Some(f) => serializer.serialize_i32(f.as_i32()),
        None => serializer.serialize_none(),
    }
}

/// One reported violation.
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolViolation {
    /// How bad it is.
    pub severity: ViolationSeverity,
    /// Which subsystem noticed.
    pub kind: ViolationKind,
    /// What happened.
    pub message: String,
    /// `file:line` of the report.
    pub location: &'static str,
    /// The frame involved, if any.
    #[serde(serialize_with = "serialize_frame")]
    pub frame: Option<Frame>,
    /// Extra key/value diagnostics, such as the player or the two hashes.
    pub context: BTreeMap<String, String>,
}

impl ProtocolViolation {
    /// Creates a violation with no frame and no context.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            frame: None,
            context: BTreeMap::new(),
        }
    }

    /// Attaches the frame.
    #[must_use]
    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frame = Some(frame);
        self
    }

    /// Adds a diagnostic field.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    fn frame_label(&self) -> Option<i32> {
        self.frame.filter(|f| !f.is_null()).map(Frame::as_i32)
    }

    fn context_label(&self) -> String {
        let pairs: Vec<String> = self
            .context
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        format!("{{{}}}", pairs.join(", "))
    }

    /// Serializes to JSON for desync dumps.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }

    /// Serializes to indented JSON.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json_pretty(&self) -> Option<String> {
        serde_json::to_string_pretty(self).ok()
    }
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}] {} (at {}", self.severity, self.kind, self.message, self.location)?;
        if let Some(frame) = self.frame_label() {
            write!(f, ", frame={frame}")?;
        }
        if !self.context.is_empty() {
            write!(f, ", context={}", self.context_label())?;
        }
        f.write_str(")")
    }
}

/// Receives violations as they are detected.
///
/// Called synchronously from inside the reporting component; implementations must not call
/// back into it.
pub trait ViolationObserver {
    /// Handles one violation.
    fn on_violation(&self, violation: &ProtocolViolation);
}

/// Logs warnings with `tracing::warn!` and everything worse with `tracing::error!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        let severity = violation.severity.as_str();
        let kind = violation.kind.as_str();
        let location = violation.location;
        let frame = violation.frame_label();
        let context = violation.context_label();
        if violation.severity == ViolationSeverity::Warning {
            tracing::warn!(severity, kind, location, ?frame, %context, "{}", violation.message);
        } else {
            tracing::error!(severity, kind, location, ?frame, %context, "{}", violation.message);
        }
    }
}

/// Keeps every violation in memory. Used by tests.
///
/// ```
/// use fortress_lockstep::telemetry::{
///     CollectingObserver, ProtocolViolation, ViolationKind, ViolationObserver, ViolationSeverity,
/// };
///
/// let observer = CollectingObserver::new();
/// observer.on_violation(&ProtocolViolation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::WireFormat,
///     "chunk out of bounds",
///     "test.rs:1",
/// ));
///
/// assert_eq!(observer.len(), 1);
/// assert!(observer.has_violation(ViolationKind::WireFormat));
/// ```
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<ProtocolViolation>>,
}

impl CollectingObserver {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies out everything collected so far.
    #[must_use]
    pub fn violations(&self) -> Vec<ProtocolViolation> {
        self.violations.lock().clone()
    }

    /// Number of violations collected.
    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    /// True if nothing has been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    /// True if at least one violation of `kind` was collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.lock().iter().any(|v| v.kind == kind)
    }

    /// Every collected violation of `kind`, in report order.
    #[must_use]
    pub fn violations_of_kind(&self, kind: ViolationKind) -> Vec<ProtocolViolation> {
        self.violations
            .lock()
            .iter()
            .filter(|v| v.kind == kind)
            .cloned()
            .collect()
    }

    /// Forgets everything collected.
    pub fn clear(&self) {
        self.violations.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Hands `violation` to `observer`, or to [`TracingObserver`] when there is none.
pub fn report_to_observer<O: ViolationObserver + ?Sized>(
    observer: Option<&Arc<O>>,
    violation: &ProtocolViolation,
) {
    match observer {
        Some(observer) => observer.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Reports a violation through a component's `Option<Arc<dyn ViolationObserver>>`.
///
/// ```text
/// report_violation_to!(observer, severity, kind, frame, "message");
/// report_violation_to!(observer, severity, kind, frame, "message with {}", args);
/// ```
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, $severity:expr, $kind:expr, $frame:expr, $msg:literal) => {{
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        )
        .with_frame($frame);
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, $severity:expr, $kind:expr, $frame:expr, $fmt:literal, $($arg:tt)+) => {{
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        )
        .with_frame($frame);
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn sample(kind: ViolationKind) -> ProtocolViolation {
        ProtocolViolation::new(ViolationSeverity::Warning, kind, "sample", "test.rs:1")
    }

    #[test]
    fn severity_ordering() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn kind_labels_are_snake_case() {
        assert_eq!(ViolationKind::DigestMismatch.as_str(), "digest_mismatch");
        assert_eq!(ViolationKind::WireFormat.to_string(), "wire_format");
    }

    #[test]
    fn display_includes_frame_and_context() {
        let violation = sample(ViolationKind::FrameReadiness)
            .with_frame(Frame::new(12))
            .with_context("player", 3);
        assert_eq!(
            violation.to_string(),
            "[warning/frame_readiness] sample (at test.rs:1, frame=12, context={player=3})"
        );
    }

    #[test]
    fn null_frame_is_omitted() {
        let violation = sample(ViolationKind::Disconnect).with_frame(Frame::NULL);
        assert!(!violation.to_string().contains("frame="));
    }

    #[test]
    fn collecting_observer_filters_by_kind() {
        let observer = CollectingObserver::new();
        observer.on_violation(&sample(ViolationKind::WireFormat));
        observer.on_violation(&sample(ViolationKind::Disconnect));
        observer.on_violation(&sample(ViolationKind::WireFormat));

        assert_eq!(observer.len(), 3);
        assert_eq!(observer.violations_of_kind(ViolationKind::WireFormat).len(), 2);
        observer.clear();
        assert!(observer.is_empty());
    }

    #[test]
    fn report_to_observer_prefers_given_observer() {
        let observer = Arc::new(CollectingObserver::new());
        report_to_observer(Some(&observer), &sample(ViolationKind::Configuration));
        assert_eq!(observer.len(), 1);

        // falls through to tracing
        report_to_observer(None::<&Arc<CollectingObserver>>, &sample(ViolationKind::Configuration));
        assert_eq!(observer.len(), 1);
    }

    #[test]
    fn report_macro_attaches_location_and_frame() {
        let observer: Option<Arc<dyn ViolationObserver>> = None;
        report_violation_to!(
            observer,
            ViolationSeverity::Warning,
            ViolationKind::Disconnect,
            Frame::new(4),
            "vote for slot {} ignored",
            2
        );

        let collecting = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<CollectingObserver>> = Some(collecting.clone());
        report_violation_to!(
            observer,
            ViolationSeverity::Error,
            ViolationKind::DigestMismatch,
            Frame::new(9),
            "mismatch"
        );
        let recorded = collecting.violations();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].frame, Some(Frame::new(9)));
        assert!(recorded[0].location.contains("telemetry.rs"));
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_uses_plain_frame_number() {
        let json = sample(ViolationKind::DigestMismatch)
            .with_frame(Frame::new(7))
            .to_json()
            .unwrap();
        assert!(json.contains(r#""frame":7"#));
        assert!(json.contains(r#""kind":"digest_mismatch""#));
    }
}
