//! Forward-compatibility gate.
//!
//! ATR entries and staged documents may carry an `fc` hint written by a
//! newer client. Before acting on such a document, the hint is checked
//! against this client's protocol version and extension set; the gate
//! either lets the operation continue, converts it into a transaction
//! retry, or fails the transaction fast.

use crate::error::{ErrorClass, TransactionOperationFailed};
use serde_json::Value;
use std::time::Duration;
use tracing::trace;

/// Protocol version this client implements.
pub const PROTOCOL_MAJOR: u64 = 2;
/// Protocol minor version.
pub const PROTOCOL_MINOR: u64 = 0;
/// Protocol extensions this client implements.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["TI", "RC", "BF3787"];

/// Interaction point at which a hint is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwardCompatStage {
    /// Reading the ATR during write-write conflict checking
    WwcReadingAtr,
    /// Replacing a document staged by another attempt
    WwcReplacing,
    /// Removing a document staged by another attempt
    WwcRemoving,
    /// Inserting over a document staged by another attempt
    WwcInserting,
    /// Re-reading a document during staged-insert recovery
    WwcInsertingGet,
    /// Plain get of a staged document
    Gets,
    /// Reading the ATR on behalf of a get
    GetsReadingAtr,
    /// Cleaning up a foreign attempt
    CleanupEntry,
}

impl ForwardCompatStage {
    /// Wire key of this stage inside the `fc` hint map.
    pub fn wire_name(&self) -> &'static str {
        match self {
            ForwardCompatStage::WwcReadingAtr => "WW_R",
            ForwardCompatStage::WwcReplacing => "WW_RP",
            ForwardCompatStage::WwcRemoving => "WW_RM",
            ForwardCompatStage::WwcInserting => "WW_I",
            ForwardCompatStage::WwcInsertingGet => "WW_IG",
            ForwardCompatStage::Gets => "G",
            ForwardCompatStage::GetsReadingAtr => "G_A",
            ForwardCompatStage::CleanupEntry => "CL_E",
        }
    }
}

/// What a matched requirement asks of this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    RetryTxn,
    FailFast,
}

fn behavior_from_wire(s: &str) -> Behavior {
    // Anything unrecognized fails fast: the writer knows something we
    // do not.
    if s == "r" {
        Behavior::RetryTxn
    } else {
        Behavior::FailFast
    }
}

/// Check an `fc` hint for `stage`.
///
/// `Ok(())` when the hint is absent or every requirement for the stage
/// is satisfied. Otherwise the operation fails with
/// `FORWARD_COMPAT_FAILURE`, flagged for retry or as final per the
/// requirement, honoring any requested retry delay.
pub fn check(
    stage: ForwardCompatStage,
    hint: Option<&Value>,
) -> Result<(), TransactionOperationFailed> {
    let Some(hint) = hint else { return Ok(()) };
    let Some(reqs) = hint.get(stage.wire_name()).and_then(Value::as_array) else {
        return Ok(());
    };
    for req in reqs {
        if satisfied(req) {
            continue;
        }
        let behavior = req
            .get("b")
            .and_then(Value::as_str)
            .map(behavior_from_wire)
            .unwrap_or(Behavior::FailFast);
        let err = TransactionOperationFailed::new(
            ErrorClass::Other,
            format!("forward compatibility requirement not met at {:?}", stage),
        )
        .forward_compat();
        match behavior {
            Behavior::FailFast => {
                trace!(stage = stage.wire_name(), "forward compatibility fail-fast");
                return Err(err);
            }
            Behavior::RetryTxn => {
                if let Some(delay_ms) = req.get("ra").and_then(Value::as_u64) {
                    trace!(delay_ms, "forward compatibility retry delay");
                    std::thread::sleep(Duration::from_millis(delay_ms));
                }
                trace!(stage = stage.wire_name(), "forward compatibility retry");
                return Err(err.retry());
            }
        }
    }
    Ok(())
}

/// Whether this client satisfies one requirement object.
fn satisfied(req: &Value) -> bool {
    if let Some(ext) = req.get("e").and_then(Value::as_str) {
        return SUPPORTED_EXTENSIONS.contains(&ext);
    }
    if let Some(proto) = req.get("p").and_then(Value::as_str) {
        let mut parts = proto.splitn(2, '.');
        let major: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(u64::MAX);
        let minor: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        return (PROTOCOL_MAJOR, PROTOCOL_MINOR) >= (major, minor);
    }
    // A requirement in a shape we cannot even parse is not satisfied
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_absent_hint_continues() {
        assert!(check(ForwardCompatStage::Gets, None).is_ok());
        assert!(check(ForwardCompatStage::Gets, Some(&json!({}))).is_ok());
    }

    #[test]
    fn test_other_stage_does_not_apply() {
        let hint = json!({ "WW_R": [{"p": "9.9", "b": "f"}] });
        assert!(check(ForwardCompatStage::Gets, Some(&hint)).is_ok());
    }

    #[test]
    fn test_supported_protocol_continues() {
        let hint = json!({ "G": [{"p": "1.0", "b": "f"}] });
        assert!(check(ForwardCompatStage::Gets, Some(&hint)).is_ok());
        let hint = json!({ "G": [{"p": "2.0", "b": "f"}] });
        assert!(check(ForwardCompatStage::Gets, Some(&hint)).is_ok());
    }

    #[test]
    fn test_unsupported_protocol_fails_fast() {
        let hint = json!({ "G": [{"p": "9.9", "b": "f"}] });
        let err = check(ForwardCompatStage::Gets, Some(&hint)).unwrap_err();
        assert!(!err.should_retry());
        assert!(err.should_rollback());
    }

    #[test]
    fn test_unsupported_extension_retries() {
        let hint = json!({ "WW_R": [{"e": "XX", "b": "r"}] });
        let err = check(ForwardCompatStage::WwcReadingAtr, Some(&hint)).unwrap_err();
        assert!(err.should_retry());
    }

    #[test]
    fn test_supported_extension_continues() {
        let hint = json!({ "WW_R": [{"e": "TI", "b": "f"}] });
        assert!(check(ForwardCompatStage::WwcReadingAtr, Some(&hint)).is_ok());
    }
}
