use crate::ledger::{Ledger, LedgerError, RecordOutcome};
use crate::registry::{self, Enrollment, Registry, RegistryError};
use attend_core::{EmbedError, Embedding, FaceEmbedder, Matcher};
use chrono::{DateTime, Local};
use image::DynamicImage;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("no enrollment found for id {0:?}")]
    UnknownIdentity(String),
    #[error("no face detected in the enrolled photo for {id:?} ({path}); re-enroll this identity")]
    NoFaceInReference { id: String, path: PathBuf },
    #[error("no face detected in the captured photo; recapture and try again")]
    NoFaceInProbe,
    #[error("no face detected in the photo to enroll for {id:?}; recapture before enrolling")]
    NoFaceInNewEnrollment { id: String },
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbedError),
}

impl VerifyError {
    /// Only a fresh capture without a face is worth recapturing for.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VerifyError::NoFaceInProbe | VerifyError::NoFaceInNewEnrollment { .. }
        )
    }

    /// Registry or ledger storage failure.
    pub fn is_store_error(&self) -> bool {
        matches!(self, VerifyError::Registry(_) | VerifyError::Ledger(_))
    }
}

#[derive(Debug, Clone)]
pub struct Acceptance {
    pub id: String,
    pub display_name: String,
    pub distance: f32,
    pub attendance: RecordOutcome,
}

#[derive(Debug, Clone)]
pub enum VerificationOutcome {
    Accepted(Acceptance),
    Rejected { id: String, distance: f32 },
}

impl VerificationOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, VerificationOutcome::Accepted(_))
    }
}

/// Result of checking an enrolled photo without a probe.
#[derive(Debug, Clone)]
pub struct ReferenceCheck {
    pub enrollment: Enrollment,
    pub faces: usize,
}

/// Matches a probe photo against the enrolled photo for a claimed id and
/// marks attendance on a match.
///
/// The ledger `record` on acceptance is the only write; the registry is
/// only ever read.
pub struct Verifier<E, M> {
    registry: Registry,
    ledger: Ledger,
    embedder: E,
    matcher: M,
}

impl<E: FaceEmbedder, M: Matcher> Verifier<E, M> {
    pub fn new(registry: Registry, ledger: Ledger, embedder: E, matcher: M) -> Self {
        Self {
            registry,
            ledger,
            embedder,
            matcher,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    /// Enroll through the same embedder used for verification, refusing a
    /// photo with no detectable face. Fields are checked before the embedder runs.
    pub fn enroll_checked(
        &mut self,
        id: &str,
        display_name: &str,
        image: &DynamicImage,
    ) -> Result<Enrollment, VerifyError> {
        let id = registry::validate_id(id)?;
        registry::validate_name(display_name)?;
        if self.embedder.embed(image)?.is_empty() {
            return Err(VerifyError::NoFaceInNewEnrollment { id: id.to_string() });
        }
        Ok(self.registry.enroll(id, display_name, image)?)
    }

    pub fn verify(&mut self, id: &str, probe: DynamicImage) -> Result<VerificationOutcome, VerifyError> {
        self.verify_at(id, probe, Local::now())
    }

    /// Verify `probe` against the enrollment for `id`, recording attendance
    /// at `now` on a match. The probe is dropped before returning.
    pub fn verify_at(
        &mut self,
        id: &str,
        probe: DynamicImage,
        now: DateTime<Local>,
    ) -> Result<VerificationOutcome, VerifyError> {
        let enrollment = self.lookup(id)?;
        let reference = self.reference_embedding(&enrollment)?;

        let probe_embedding = self
            .embedder
            .embed(&probe)?
            .into_iter()
            .next()
            .ok_or(VerifyError::NoFaceInProbe)?;
        drop(probe);

        if reference.model_version != probe_embedding.model_version {
            tracing::warn!(
                reference = ?reference.model_version,
                probe = ?probe_embedding.model_version,
                "embedding model versions differ; distance may be meaningless"
            );
        }

        let distance = self.matcher.distance(&reference, &probe_embedding);
        if !self.matcher.is_match(distance) {
            tracing::info!(id = %enrollment.id, distance, "verification rejected");
            return Ok(VerificationOutcome::Rejected {
                id: enrollment.id,
                distance,
            });
        }

        let attendance = self
            .ledger
            .record(&enrollment.id, &enrollment.display_name, now)?;
        tracing::info!(
            id = %enrollment.id,
            distance,
            new_record = attendance.is_new(),
            "verification accepted"
        );

        Ok(VerificationOutcome::Accepted(Acceptance {
            id: enrollment.id,
            display_name: enrollment.display_name,
            distance,
            attendance,
        }))
    }

    /// Confirm the enrolled photo for `id` still yields a face.
    pub fn check_reference(&mut self, id: &str) -> Result<ReferenceCheck, VerifyError> {
        let enrollment = self.lookup(id)?;
        let image = enrollment.load_image()?;
        let faces = self.embedder.embed(&image)?.len();
        if faces == 0 {
            return Err(VerifyError::NoFaceInReference {
                id: enrollment.id,
                path: enrollment.image_path,
            });
        }
        Ok(ReferenceCheck { enrollment, faces })
    }

    fn lookup(&self, id: &str) -> Result<Enrollment, VerifyError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(VerifyError::UnknownIdentity(String::new()));
        }
        self.registry
            .find_by_id(id)?
            .ok_or_else(|| VerifyError::UnknownIdentity(id.to_string()))
    }

    fn reference_embedding(&mut self, enrollment: &Enrollment) -> Result<Embedding, VerifyError> {
        let image = enrollment.load_image()?;
        self.embedder
            .embed(&image)?
            .into_iter()
            .next()
            .ok_or_else(|| VerifyError::NoFaceInReference {
                id: enrollment.id.clone(),
                path: enrollment.image_path.clone(),
            })
    }
}
