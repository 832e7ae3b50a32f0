//! Tamper-evident audit logging.

pub mod log;
pub mod record;
pub mod rotation;

pub use log::{AuditLog, IntegrityReport, SearchFilter};
pub use record::{
    AuditAction, AuditActor, AuditCategory, AuditLevel, AuditOutcome, AuditRecord, AuditResource,
    ComplianceBlock, IntegrityBlock,
};
pub use rotation::{ArchiveIndex, IndexEntry, LogRotator};
