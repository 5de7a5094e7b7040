//! attend-engine — Enrollment registry, attendance ledger and the
//! verification workflow that ties them to a face embedder.

pub mod ledger;
pub mod registry;
pub mod verifier;

pub use ledger::{AttendanceRecord, Ledger, LedgerError, RecordOutcome};
pub use registry::{validate_id, validate_name, Enrollment, Registry, RegistryError};
pub use verifier::{Acceptance, ReferenceCheck, VerificationOutcome, Verifier, VerifyError};
