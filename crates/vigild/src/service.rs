//! Server side of the second factor.
//!
//! Order of checks on a verification: challenge token, rate limit, liveness
//! evidence, enrolled profile, distance. Evidence is rejected before any
//! distance is computed. Callers only ever see a [`Rejection`] reason code;
//! distances stay in the daemon's debug log.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use vigil_core::{
    EnrollmentBackend, EuclideanMatcher, FaceDescriptor, LivenessPolicy, LivenessViolation,
    MatchError, Matcher, RejectReason, Rejection, SessionGrant, SubmitError, VerificationBackend,
    VerificationRequest,
};

use crate::rate_limiter::{Locked, RateLimiter};
use crate::store::{DescriptorInfo, DescriptorStore, StoreError};
use crate::tokens::{IssuedChallenge, TokenError, TokenIssuer};

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub match_threshold: f32,
    pub model_version: String,
    pub liveness: LivenessPolicy,
    pub challenge_ttl: Duration,
    pub session_ttl: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            match_threshold: 0.6,
            model_version: "unknown".to_string(),
            liveness: LivenessPolicy::default(),
            challenge_ttl: Duration::from_secs(300),
            session_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("challenge token rejected: {0}")]
    Token(#[from] TokenError),
    #[error("user is locked out for {}s", .0.retry_after.as_secs())]
    RateLimited(Locked),
    #[error("liveness evidence rejected: {0}")]
    Liveness(#[from] LivenessViolation),
    #[error("user has no enrolled profile")]
    NotEnrolled,
    #[error("face does not match the enrolled profile")]
    Mismatch,
    #[error("descriptor unusable: {0}")]
    BadDescriptor(MatchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl VerifyError {
    /// Whether the attempt counts against the user's rate limit.
    fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            VerifyError::Liveness(_) | VerifyError::Mismatch | VerifyError::BadDescriptor(_)
        )
    }

    /// Client-facing form. Messages are fixed strings; no distances,
    /// thresholds or storage details leave the daemon.
    pub fn rejection(&self) -> Rejection {
        match self {
            VerifyError::Token(_) => Rejection::new(
                RejectReason::InvalidToken,
                "The sign-in challenge is no longer valid. Start again.",
            ),
            VerifyError::RateLimited(locked) => Rejection::new(
                RejectReason::RateLimited,
                format!(
                    "Too many failed attempts. Try again in {} seconds.",
                    locked.retry_after.as_secs().max(1)
                ),
            ),
            VerifyError::Liveness(_) => Rejection::new(
                RejectReason::LivenessInsufficient,
                "Liveness check incomplete. Blink and move your head as prompted.",
            ),
            VerifyError::NotEnrolled => {
                Rejection::new(RejectReason::NotEnrolled, "No face is enrolled for this account.")
            }
            VerifyError::Mismatch | VerifyError::BadDescriptor(_) => {
                Rejection::new(RejectReason::FaceMismatch, "Face not recognised. Try again.")
            }
            VerifyError::Store(_) => {
                Rejection::new(RejectReason::Internal, "Verification is unavailable right now.")
            }
        }
    }
}

/// Daemon status summary, readable by any caller. Matching thresholds stay out.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub version: &'static str,
    pub descriptors_stored: u64,
    pub descriptor_dim: usize,
    pub min_blinks: u32,
    pub min_head_movements: u32,
}

pub struct VerificationService {
    store: DescriptorStore,
    matcher: EuclideanMatcher,
    settings: ServiceSettings,
    tokens: Mutex<TokenIssuer>,
    limiter: Mutex<RateLimiter>,
}

impl VerificationService {
    pub fn new(store: DescriptorStore, settings: ServiceSettings) -> Self {
        Self::with_rate_limiter(store, settings, RateLimiter::default())
    }

    pub fn with_rate_limiter(
        store: DescriptorStore,
        settings: ServiceSettings,
        limiter: RateLimiter,
    ) -> Self {
        let tokens = TokenIssuer::new(settings.challenge_ttl, settings.session_ttl);
        Self {
            store,
            matcher: EuclideanMatcher,
            settings,
            tokens: Mutex::new(tokens),
            limiter: Mutex::new(limiter),
        }
    }

    /// Replace the user's profile with a freshly captured descriptor set.
    pub async fn enroll(&self, user: &str, descriptors: &[FaceDescriptor]) -> Result<usize, StoreError> {
        let stored = self
            .store
            .replace_profile(user, descriptors, &self.settings.model_version)
            .await?;
        tracing::info!(user, stored, "profile enrolled");
        Ok(stored)
    }

    pub async fn issue_challenge(&self, user: &str) -> IssuedChallenge {
        self.tokens.lock().await.issue_challenge(user)
    }

    /// User a pending challenge token belongs to.
    pub async fn challenge_user(&self, token: &str) -> Result<String, TokenError> {
        self.tokens.lock().await.challenge_user(token)
    }

    pub async fn session_user(&self, token: &str) -> Result<String, TokenError> {
        self.tokens.lock().await.session_user(token)
    }

    pub async fn verify(&self, request: VerificationRequest) -> Result<SessionGrant, VerifyError> {
        let user = self.challenge_user(&request.challenge_token).await?;

        self.limiter.lock().await.check(&user).map_err(|locked| {
            tracing::warn!(user = %user, retry_after_secs = locked.retry_after.as_secs(), "verify: rate limited");
            VerifyError::RateLimited(locked)
        })?;

        let outcome = self.judge(&user, &request).await;
        match &outcome {
            Ok(()) => self.limiter.lock().await.record_success(&user),
            Err(err) if err.counts_as_failure() => {
                tracing::warn!(user = %user, error = %err, "verify: attempt refused");
                self.limiter.lock().await.record_failure(&user);
            }
            Err(err) => tracing::error!(user = %user, error = %err, "verify: attempt failed"),
        }
        outcome?;

        let grant = self.tokens.lock().await.redeem(&request.challenge_token)?;
        tracing::info!(user = %user, "verify: session granted");
        Ok(grant)
    }

    async fn judge(&self, user: &str, request: &VerificationRequest) -> Result<(), VerifyError> {
        self.settings.liveness.validate(&request.liveness)?;

        let profile = self.store.profile_for_user(user).await?;
        let result = self
            .matcher
            .compare(&request.descriptor, &profile, self.settings.match_threshold)
            .map_err(|err| match err {
                MatchError::NotEnrolled => VerifyError::NotEnrolled,
                other => VerifyError::BadDescriptor(other),
            })?;

        tracing::debug!(
            user,
            distance = result.distance,
            best_index = result.best_index,
            matched = result.matched,
            "verify: compared against profile"
        );
        if result.matched {
            Ok(())
        } else {
            Err(VerifyError::Mismatch)
        }
    }

    pub async fn list_profile(&self, user: &str) -> Result<Vec<DescriptorInfo>, StoreError> {
        self.store.list_by_user(user).await
    }

    pub async fn remove_profile(&self, user: &str) -> Result<usize, StoreError> {
        let removed = self.store.remove_profile(user).await?;
        tracing::info!(user, removed, "profile removed");
        Ok(removed)
    }

    pub async fn status(&self) -> Result<ServiceStatus, StoreError> {
        Ok(ServiceStatus {
            version: env!("CARGO_PKG_VERSION"),
            descriptors_stored: self.store.count_all().await?,
            descriptor_dim: self.store.dim(),
            min_blinks: self.settings.liveness.min_blinks,
            min_head_movements: self.settings.liveness.min_head_movements,
        })
    }

    /// Enrollment sink bound to one user, for driving an
    /// [`EnrollmentFlow`](vigil_core::EnrollmentFlow) in-process.
    pub fn enrollment_for<'a>(&'a self, user: &str) -> UserEnrollment<'a> {
        UserEnrollment {
            service: self,
            user: user.to_string(),
        }
    }
}

impl VerificationBackend for VerificationService {
    async fn submit_verification(
        &self,
        request: VerificationRequest,
    ) -> Result<SessionGrant, Rejection> {
        self.verify(request).await.map_err(|err| err.rejection())
    }
}

pub struct UserEnrollment<'a> {
    service: &'a VerificationService,
    user: String,
}

impl EnrollmentBackend for UserEnrollment<'_> {
    async fn submit_enrollment(&self, descriptors: &[FaceDescriptor]) -> Result<usize, SubmitError> {
        self.service
            .enroll(&self.user, descriptors)
            .await
            .map_err(|err| match err {
                StoreError::InvalidDimension { .. }
                | StoreError::InvalidValue
                | StoreError::EmptyProfile => SubmitError::Rejected(err.to_string()),
                other => SubmitError::Unavailable(other.to_string()),
            })
    }
}
