use std::sync::Arc;

use serde::Serialize;
use vigil_core::{FaceDescriptor, Rejection, SessionGrant, VerificationRequest};
use zbus::interface;

use crate::service::VerificationService;

pub const BUS_NAME: &str = "org.freedesktop.Vigil1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Vigil1";

/// Reply body of `Verify`: exactly one of the two fields is present.
#[derive(Debug, Serialize)]
pub struct VerifyReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant: Option<SessionGrant>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
}

/// D-Bus interface for the Vigil daemon.
///
/// Bus name: org.freedesktop.Vigil1
/// Object path: /org/freedesktop/Vigil1
pub struct VigilService {
    service: Arc<VerificationService>,
    session_bus: bool,
}

impl VigilService {
    pub fn new(service: Arc<VerificationService>, session_bus: bool) -> Self {
        Self {
            service,
            session_bus,
        }
    }

    /// On the system bus the caller must be root or the target user. On the
    /// session bus (development mode) every caller is the same user.
    async fn authorize(
        &self,
        user: &str,
        header: &zbus::message::Header<'_>,
        conn: &zbus::Connection,
    ) -> zbus::fdo::Result<()> {
        if self.session_bus {
            return Ok(());
        }
        let caller_uid = caller_uid(header, conn).await?;
        if caller_uid == 0 {
            return Ok(());
        }
        match uid_for_name(user) {
            Some(expected_uid) if caller_uid == expected_uid => Ok(()),
            Some(_) => {
                tracing::warn!(user, caller_uid, "caller UID does not match target user");
                Err(zbus::fdo::Error::AccessDenied(format!(
                    "caller is not permitted to act for user '{user}'"
                )))
            }
            None => {
                tracing::warn!(user, "unknown user");
                Err(zbus::fdo::Error::Failed(format!("unknown user '{user}'")))
            }
        }
    }

    async fn require_root(
        &self,
        header: &zbus::message::Header<'_>,
        conn: &zbus::Connection,
    ) -> zbus::fdo::Result<()> {
        if self.session_bus {
            return Ok(());
        }
        let caller_uid = caller_uid(header, conn).await?;
        if caller_uid != 0 {
            tracing::warn!(caller_uid, "privileged method called by non-root caller");
            return Err(zbus::fdo::Error::AccessDenied(
                "only root may issue challenges".to_string(),
            ));
        }
        Ok(())
    }
}

/// UID of the D-Bus peer that sent `header`.
async fn caller_uid(
    header: &zbus::message::Header<'_>,
    conn: &zbus::Connection,
) -> zbus::fdo::Result<u32> {
    let sender = header
        .sender()
        .ok_or_else(|| zbus::fdo::Error::Failed("no sender in message".to_string()))?;
    let dbus_proxy = zbus::fdo::DBusProxy::new(conn)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    let bus_name = zbus::names::BusName::try_from(sender.as_str())
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    dbus_proxy
        .get_connection_unix_user(bus_name)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn uid_for_name(name: &str) -> Option<u32> {
    nix::unistd::User::from_name(name)
        .ok()
        .flatten()
        .map(|user| user.uid.as_raw())
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.freedesktop.Vigil1")]
impl VigilService {
    /// Replace the user's profile with the given ordered descriptors
    /// (JSON array of float arrays). Returns the number stored.
    async fn enroll(
        &self,
        user: &str,
        descriptors_json: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<u32> {
        tracing::info!(user, "enroll requested");
        self.authorize(user, &header, conn).await?;

        let descriptors: Vec<FaceDescriptor> = serde_json::from_str(descriptors_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
        let stored = self.service.enroll(user, &descriptors).await.map_err(|e| {
            tracing::error!(user, error = %e, "enroll failed");
            failed(e)
        })?;
        Ok(stored as u32)
    }

    /// Start the face step for a user who has passed the password step.
    /// Root-only. Returns `{challenge_token, user, expires_at}` as JSON.
    async fn issue_challenge(
        &self,
        user: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        self.require_root(&header, conn).await?;
        let issued = self.service.issue_challenge(user).await;
        tracing::info!(user, "challenge issued");
        serde_json::to_string(&issued).map_err(failed)
    }

    /// Submit `{challenge_token, descriptor, liveness}`. Returns a JSON
    /// [`VerifyReply`]; refusals are replies, not D-Bus errors, so the
    /// client can act on the reason code.
    async fn verify(
        &self,
        request_json: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        let request: VerificationRequest = serde_json::from_str(request_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

        // The token names the user; authorize against that user before
        // any matching work.
        if let Ok(user) = self.service.challenge_user(&request.challenge_token).await {
            self.authorize(&user, &header, conn).await?;
        }

        let reply = match self.service.verify(request).await {
            Ok(grant) => VerifyReply {
                grant: Some(grant),
                rejection: None,
            },
            Err(err) => VerifyReply {
                grant: None,
                rejection: Some(err.rejection()),
            },
        };
        serde_json::to_string(&reply).map_err(failed)
    }

    /// User owning a live session token.
    async fn validate_session(&self, session_token: &str) -> zbus::fdo::Result<String> {
        self.service
            .session_user(session_token)
            .await
            .map_err(|e| zbus::fdo::Error::AccessDenied(e.to_string()))
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.service.status().await.map_err(failed)?;
        serde_json::to_string(&status).map_err(failed)
    }

    /// List the user's stored descriptors (metadata only) as JSON.
    async fn list_profile(
        &self,
        user: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        self.authorize(user, &header, conn).await?;
        let profile = self.service.list_profile(user).await.map_err(failed)?;
        serde_json::to_string(&profile).map_err(failed)
    }

    /// Delete the user's profile. Returns the number of descriptors removed.
    async fn remove_profile(
        &self,
        user: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<u32> {
        self.authorize(user, &header, conn).await?;
        let removed = self.service.remove_profile(user).await.map_err(failed)?;
        if removed == 0 {
            tracing::warn!(user, "remove_profile: nothing enrolled");
        }
        Ok(removed as u32)
    }
}
