use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use vigil_core::SessionGrant;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("unknown token")]
    Unknown,
    #[error("token expired")]
    Expired,
}

/// Challenge token handed to the client after the password step.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedChallenge {
    pub challenge_token: String,
    pub user: String,
    pub expires_at: DateTime<Utc>,
}

struct Pending {
    user: String,
    deadline: Instant,
}

struct Session {
    user: String,
    deadline: Instant,
}

/// In-memory challenge and session tokens.
///
/// A challenge token names the user who passed the first factor. It stays
/// valid across failed face checks until its TTL runs out and is consumed
/// only by a successful one, which mints a session token.
pub struct TokenIssuer {
    challenge_ttl: Duration,
    session_ttl: Duration,
    challenges: HashMap<String, Pending>,
    sessions: HashMap<String, Session>,
}

impl TokenIssuer {
    pub fn new(challenge_ttl: Duration, session_ttl: Duration) -> Self {
        Self {
            challenge_ttl,
            session_ttl,
            challenges: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    pub fn issue_challenge(&mut self, user: &str) -> IssuedChallenge {
        self.prune();
        let token = uuid::Uuid::new_v4().to_string();
        self.challenges.insert(
            token.clone(),
            Pending {
                user: user.to_string(),
                deadline: Instant::now() + self.challenge_ttl,
            },
        );
        tracing::debug!(user, ttl_secs = self.challenge_ttl.as_secs(), "challenge issued");
        IssuedChallenge {
            challenge_token: token,
            user: user.to_string(),
            expires_at: wall_clock_after(self.challenge_ttl),
        }
    }

    /// User the challenge token was issued for, without consuming it.
    pub fn challenge_user(&mut self, token: &str) -> Result<String, TokenError> {
        let pending = self.challenges.get(token).ok_or(TokenError::Unknown)?;
        if Instant::now() >= pending.deadline {
            self.challenges.remove(token);
            return Err(TokenError::Expired);
        }
        Ok(pending.user.clone())
    }

    /// Consume a valid challenge token and mint a session for its user.
    pub fn redeem(&mut self, token: &str) -> Result<SessionGrant, TokenError> {
        let user = self.challenge_user(token)?;
        self.challenges.remove(token);

        let session_token = uuid::Uuid::new_v4().to_string();
        self.sessions.insert(
            session_token.clone(),
            Session {
                user: user.clone(),
                deadline: Instant::now() + self.session_ttl,
            },
        );
        Ok(SessionGrant {
            session_token,
            user,
            expires_at: wall_clock_after(self.session_ttl),
        })
    }

    /// User owning a live session token.
    pub fn session_user(&mut self, token: &str) -> Result<String, TokenError> {
        let session = self.sessions.get(token).ok_or(TokenError::Unknown)?;
        if Instant::now() >= session.deadline {
            self.sessions.remove(token);
            return Err(TokenError::Expired);
        }
        Ok(session.user.clone())
    }

    fn prune(&mut self) {
        let now = Instant::now();
        self.challenges.retain(|_, p| p.deadline > now);
        self.sessions.retain(|_, s| s.deadline > now);
    }
}

fn wall_clock_after(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(Duration::from_secs(300), Duration::from_secs(3600))
    }

    #[test]
    fn challenge_survives_lookups_and_is_consumed_by_redeem() {
        let mut tokens = issuer();
        let issued = tokens.issue_challenge("alice");

        assert_eq!(tokens.challenge_user(&issued.challenge_token).unwrap(), "alice");
        assert_eq!(tokens.challenge_user(&issued.challenge_token).unwrap(), "alice");

        let grant = tokens.redeem(&issued.challenge_token).unwrap();
        assert_eq!(grant.user, "alice");
        assert!(grant.expires_at > Utc::now());

        assert_eq!(tokens.redeem(&issued.challenge_token), Err(TokenError::Unknown));
        assert_eq!(tokens.session_user(&grant.session_token).unwrap(), "alice");
    }

    #[test]
    fn expired_challenge_is_rejected() {
        let mut tokens = TokenIssuer::new(Duration::ZERO, Duration::from_secs(3600));
        let issued = tokens.issue_challenge("alice");
        assert_eq!(tokens.challenge_user(&issued.challenge_token), Err(TokenError::Expired));
        // Gone after the first expired lookup.
        assert_eq!(tokens.redeem(&issued.challenge_token), Err(TokenError::Unknown));
    }

    #[test]
    fn expired_session_is_rejected() {
        let mut tokens = TokenIssuer::new(Duration::from_secs(300), Duration::ZERO);
        let issued = tokens.issue_challenge("alice");
        let grant = tokens.redeem(&issued.challenge_token).unwrap();
        assert_eq!(tokens.session_user(&grant.session_token), Err(TokenError::Expired));
    }

    #[test]
    fn session_tokens_are_not_challenge_tokens() {
        let mut tokens = issuer();
        let issued = tokens.issue_challenge("alice");
        let grant = tokens.redeem(&issued.challenge_token).unwrap();
        assert_eq!(tokens.challenge_user(&grant.session_token), Err(TokenError::Unknown));
        assert_eq!(tokens.session_user(&issued.challenge_token), Err(TokenError::Unknown));
    }

    #[test]
    fn tokens_are_unique_per_issue() {
        let mut tokens = issuer();
        let a = tokens.issue_challenge("alice");
        let b = tokens.issue_challenge("alice");
        assert_ne!(a.challenge_token, b.challenge_token);
    }
}
