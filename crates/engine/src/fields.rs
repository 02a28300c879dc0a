//! Path constants for the transaction metadata written into documents
//! and Active Transaction Records.
//!
//! Field names are kept as short as possible: ATR entries accumulate
//! one object per attempt and must not overflow the record document.

/// Xattr root holding all per-document transaction metadata.
pub const TXN_PREFIX: &str = "txn";

/// Transaction id owning the stage.
pub const TXN_ID: &str = "txn.id.txn";
/// Attempt id owning the stage.
pub const ATTEMPT_ID: &str = "txn.id.atmpt";
/// Id of the owning ATR document.
pub const ATR_ID: &str = "txn.atr.id";
/// Bucket of the owning ATR.
pub const ATR_BUCKET: &str = "txn.atr.bkt";
/// Scope of the owning ATR.
pub const ATR_SCOPE: &str = "txn.atr.scp";
/// Collection of the owning ATR.
pub const ATR_COLLECTION: &str = "txn.atr.coll";
/// Staged operation kind: `insert` | `replace` | `remove`.
pub const OP_TYPE: &str = "txn.op.type";
/// Staged content (absent for removes).
pub const STAGED_DATA: &str = "txn.op.stgd";
/// Body CRC at stage time, used to spot interleaved writes.
pub const CRC32_OF_STAGING: &str = "txn.op.crc32";
/// Restore-data subtree root.
pub const RESTORE_PREFIX: &str = "txn.restore";
/// Pre-transaction CAS.
pub const PRE_TXN_CAS: &str = "txn.restore.CAS";
/// Pre-transaction revision id.
pub const PRE_TXN_REVID: &str = "txn.restore.revid";
/// Pre-transaction expiry.
pub const PRE_TXN_EXPTIME: &str = "txn.restore.exptime";
/// Forward-compatibility hints on the staged document.
pub const FORWARD_COMPAT: &str = "txn.fc";

// ATR document layout: body is `{ "attempts": { attempt_id: entry } }`.

/// Map of attempt entries in an ATR document.
pub const ATR_FIELD_ATTEMPTS: &str = "attempts";
/// Transaction id that owns the attempt.
pub const ATR_FIELD_TRANSACTION_ID: &str = "tid";
/// Attempt state.
pub const ATR_FIELD_STATUS: &str = "st";
/// Start timestamp (CAS-derived).
pub const ATR_FIELD_START_TIMESTAMP: &str = "tst";
/// Commit-start timestamp.
pub const ATR_FIELD_START_COMMIT: &str = "tsc";
/// Completion timestamp.
pub const ATR_FIELD_TIMESTAMP_COMPLETE: &str = "tsco";
/// Rollback-start timestamp.
pub const ATR_FIELD_TIMESTAMP_ROLLBACK_START: &str = "tsrs";
/// Rollback-complete timestamp.
pub const ATR_FIELD_TIMESTAMP_ROLLBACK_COMPLETE: &str = "tsrc";
/// Expiry window in ms from `tst`.
pub const ATR_FIELD_EXPIRES_AFTER_MS: &str = "exp";
/// Doc-records staged for insert.
pub const ATR_FIELD_DOCS_INSERTED: &str = "ins";
/// Doc-records staged for replace.
pub const ATR_FIELD_DOCS_REPLACED: &str = "rep";
/// Doc-records staged for remove.
pub const ATR_FIELD_DOCS_REMOVED: &str = "rem";
/// Forward-compatibility hints on the ATR entry.
pub const ATR_FIELD_FORWARD_COMPAT: &str = "fc";

/// Doc-record field: document id.
pub const ATR_FIELD_PER_DOC_ID: &str = "id";
/// Doc-record field: bucket.
pub const ATR_FIELD_PER_DOC_BUCKET: &str = "bkt";
/// Doc-record field: scope.
pub const ATR_FIELD_PER_DOC_SCOPE: &str = "scp";
/// Doc-record field: collection.
pub const ATR_FIELD_PER_DOC_COLLECTION: &str = "coll";

/// Id of the per-bucket cleanup client registry document.
pub const CLIENT_RECORD_ID: &str = "_txn:client-record";
/// Registry field: client map.
pub const CLIENT_RECORD_CLIENTS: &str = "clients";
/// Registry field: last heartbeat (CAS-derived ms).
pub const CLIENT_RECORD_HEARTBEAT: &str = "heartbeat_ms";
/// Registry field: heartbeat validity in ms.
pub const CLIENT_RECORD_EXPIRES: &str = "expires_ms";
