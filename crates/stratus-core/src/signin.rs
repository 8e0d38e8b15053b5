//! Sign-in / sign-out handling.
//!
//! Sign-in authenticates the session: token validation, device-identity
//! binding, owner-claim check, then the ownership check — with the
//! device-event subscription established *before* the ownership check
//! so a deregistration racing it is never missed. Every sign-in/out
//! failure closes the connection after the error response is written;
//! the device re-establishes the session from scratch.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use stratus_proto::{Code, ContentFormat, Message, SignInRequest, SignInResponse};

use crate::auth::{AuthorizationContext, CallContext};
use crate::backend::{ConnectionStatus, UpdateDeviceMetadataRequest};
use crate::config::ReconnectConfig;
use crate::error::ServiceError;
use crate::gateway::TlsIdentity;
use crate::identity::{Claims, DeviceEvent, DeviceEventHandler, Unsubscribe};
use crate::session::Session;
use crate::subscriber::{DeviceSubscriber, SubscriberHandler};

/// How a successful sign-in relates to the session's previous identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SignInUpdate {
    /// Same device and user, e.g. a token refresh; only the
    /// authorization context and the expiry move.
    None,
    /// First sign-in on this connection.
    New,
    /// A different device or user; the predecessor's state is torn
    /// down before the new identity is installed.
    Changed,
}

fn classify(previous: Option<&AuthorizationContext>, next: &AuthorizationContext) -> SignInUpdate {
    match previous {
        None => SignInUpdate::New,
        Some(previous) => {
            if previous.device_id == next.device_id && previous.user_id == next.user_id {
                SignInUpdate::None
            } else {
                SignInUpdate::Changed
            }
        }
    }
}

impl Session {
    /// Handle a sign-in or sign-out request: writes the response (or an
    /// error response) to the device and closes the connection on any
    /// failure. Returns the written message.
    pub async fn handle_session_request(
        &self,
        request: SignInRequest,
        accept: ContentFormat,
    ) -> Message {
        let login = request.login;
        let result = if login {
            self.sign_in(request)
                .await
                .and_then(|response| build_response(Code::Changed, accept, &response))
        } else {
            self.sign_out(request).await.map(|()| Message::new(Code::Deleted))
        };

        match result {
            Ok(message) => {
                self.transport.write_message(message.clone());
                message
            }
            Err(err) => {
                let message = Message::with_text(err.response_code(), &err.to_string());
                self.transport.write_message(message.clone());
                tracing::warn!(
                    remote = %self.transport.remote_addr(),
                    login,
                    error = %err,
                    "session request failed"
                );
                self.close_on(&err);
                message
            }
        }
    }

    /// Authenticate this connection for the requested identity.
    pub async fn sign_in(&self, request: SignInRequest) -> Result<SignInResponse, ServiceError> {
        request
            .check_fields()
            .map_err(|err| ServiceError::InvalidRequest(err.to_string()))?;

        let claims = self.gateway.verifier.validate(&request.access_token).await?;
        let authorization = &self.gateway.config.authorization;
        claims.validate_owner(&authorization.owner_claim, &request.user_id)?;
        let token_expiry = claims.expires_at()?;

        let device_id = self.resolve_device_id(&request, &claims)?;
        let auth = AuthorizationContext::new(
            device_id.clone(),
            request.user_id.clone(),
            request.access_token.clone(),
            token_expiry,
            claims,
        );
        auth.validate()?;

        let update = {
            let state = self.lock_state();
            classify(state.auth.as_ref(), &auth)
        };

        if update == SignInUpdate::Changed {
            // The predecessor's subscriptions, subscriber, observer and
            // event feed must be gone before the new identity appears.
            self.clean_up(true).await;
        }

        if update != SignInUpdate::None {
            let unsubscribe = self.subscribe_and_authorize(&auth).await?;
            {
                let mut state = self.lock_state();
                state.auth = Some(auth.clone());
                state.unsubscribe = Some(unsubscribe);
            }
        } else {
            // Same identity, fresh expiry: swap the context only.
            let mut state = self.lock_state();
            state.auth = Some(auth.clone());
        }

        self.exchange_cache.clear();
        self.refresh_cache.clear();

        match self.session_expiration(token_expiry) {
            Some(deadline) => {
                self.gateway
                    .expirations
                    .set(&device_id, deadline, self.cancel.clone());
            }
            None => self.gateway.expirations.remove(&device_id),
        }

        if update != SignInUpdate::None {
            let connection_id = self.transport.remote_addr();
            self.gateway.liveness.add(&device_id, &connection_id).await?;

            self.gateway
                .backend
                .update_device_metadata(
                    &auth.call_context(),
                    UpdateDeviceMetadataRequest {
                        device_id: device_id.clone(),
                        status: ConnectionStatus::Online,
                        metadata: self.metadata(),
                    },
                )
                .await?;

            let subscriber = Arc::new(DeviceSubscriber::start(
                &device_id,
                Arc::clone(&self.gateway.backend),
                Arc::clone(&self.gateway.queue),
                self.arc()? as Arc<dyn SubscriberHandler>,
                self.subscriber_reconnect(),
            ));
            {
                let mut state = self.lock_state();
                state.subscriber = Some(subscriber);
            }

            self.replace_observer(update == SignInUpdate::Changed, None)?;
        }

        tracing::info!(
            device_id = %device_id,
            user_id = %auth.user_id,
            update = ?update,
            "device signed in"
        );
        Ok(SignInResponse {
            expires_in: auth.expires_in(),
        })
    }

    /// Release the signed-in identity. Empty request fields are filled
    /// from the current context when one exists; a fully-specified
    /// request stands on its own. The presented token is re-validated
    /// (claims, owner, device binding) before the offline report it
    /// authenticates goes out.
    pub async fn sign_out(&self, request: SignInRequest) -> Result<(), ServiceError> {
        let current = {
            let state = self.lock_state();
            state.auth.clone()
        };
        let request = match &current {
            Some(auth) => request.or_current(&auth.device_id, &auth.user_id, auth.access_token()),
            None => request,
        };
        request
            .check_fields()
            .map_err(|err| ServiceError::InvalidRequest(err.to_string()))?;

        let claims = self.gateway.verifier.validate(&request.access_token).await?;
        let authorization = &self.gateway.config.authorization;
        claims.validate_owner(&authorization.owner_claim, &request.user_id)?;
        let device_id = self.resolve_device_id(&request, &claims)?;

        self.gateway
            .backend
            .update_device_metadata(
                &CallContext::new(request.access_token.clone()),
                UpdateDeviceMetadataRequest {
                    device_id: device_id.clone(),
                    status: ConnectionStatus::Offline,
                    metadata: self.metadata(),
                },
            )
            .await?;

        self.clean_up(true).await;
        let connection_id = self.transport.remote_addr();
        if let Err(err) = self.gateway.liveness.remove(&connection_id).await {
            tracing::warn!(connection_id = %connection_id, error = %err, "liveness removal failed");
        }
        self.gateway.expirations.remove(&device_id);

        tracing::info!(device_id = %device_id, "device signed out");
        Ok(())
    }

    // ── Device identity resolution ───────────────────────────────────

    /// Resolve the device identity the session binds to: a configured
    /// token claim wins, then the transport-bound identity, then the
    /// request field. Whatever wins must agree with the transport-bound
    /// identity when client certificates are required.
    fn resolve_device_id(
        &self,
        request: &SignInRequest,
        claims: &Claims,
    ) -> Result<String, ServiceError> {
        let tls = &self.gateway.config.tls;
        if tls.client_certificate_required && self.tls_identity.is_none() {
            return Err(ServiceError::DeviceBinding(
                "client certificate required but none presented".into(),
            ));
        }

        let claim_device_id = self
            .gateway
            .config
            .authorization
            .device_id_claim
            .as_ref()
            .and_then(|claim| claims.device_id(claim));

        let resolved = claim_device_id
            .or_else(|| self.tls_identity.as_ref().map(|tls| tls.device_id.clone()))
            .unwrap_or_else(|| request.device_id.clone());

        if let Some(tls) = &self.tls_identity {
            if resolved != tls.device_id {
                return Err(ServiceError::DeviceBinding(format!(
                    "device id '{resolved}' does not match certificate identity '{}'",
                    tls.device_id
                )));
            }
        }
        Ok(resolved)
    }

    /// Session deadline: token expiry, optionally capped by the client
    /// certificate's expiry.
    fn session_expiration(&self, token_expiry: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        let certificate_expiry = match &self.tls_identity {
            Some(TlsIdentity {
                valid_until: Some(valid_until),
                ..
            }) if self.gateway.config.tls.disconnect_on_expired_certificate => Some(*valid_until),
            _ => None,
        };
        match (token_expiry, certificate_expiry) {
            (Some(token), Some(cert)) => Some(token.min(cert)),
            (deadline, None) | (None, deadline) => deadline,
        }
    }

    // ── Ownership ────────────────────────────────────────────────────

    /// Subscribe to the owner's device events, then check ownership.
    ///
    /// The order is a contract: subscribing after the check would let a
    /// deregistration land in the gap and leave a deregistered device
    /// signed in.
    async fn subscribe_and_authorize(
        &self,
        auth: &AuthorizationContext,
    ) -> Result<Unsubscribe, ServiceError> {
        let device_id = auth.device_id.clone();
        let cancel = self.cancel.clone();
        let owner = auth.user_id.clone();
        let handler: DeviceEventHandler = Arc::new(move |event: &DeviceEvent| {
            if let DeviceEvent::Unregistered { device_ids, .. } = event {
                if device_ids.iter().any(|id| id == &device_id) {
                    tracing::info!(device_id = %device_ids.join(","), "device deregistered, closing connection");
                    cancel.cancel();
                }
            }
        });
        let unsubscribe = self.gateway.owners.subscribe(&owner, handler).await?;

        let owns = self
            .gateway
            .owners
            .owns_device(&auth.call_context(), &auth.device_id)
            .await;
        match owns {
            Ok(true) => Ok(unsubscribe),
            Ok(false) => {
                unsubscribe();
                Err(ServiceError::AccessDenied(auth.device_id.clone()))
            }
            Err(err) => {
                unsubscribe();
                Err(err)
            }
        }
    }

    /// Backoff settings for the device-feed subscriber, with the
    /// first retry bounded by half the keep-alive window so a broken
    /// feed is noticed before the device times the connection out.
    fn subscriber_reconnect(&self) -> ReconnectConfig {
        let reconnect = &self.gateway.config.reconnect;
        ReconnectConfig {
            initial_delay: reconnect
                .initial_delay
                .min(self.gateway.config.keep_alive_timeout / 2),
            max_delay: reconnect.max_delay,
            max_retries: reconnect.max_retries,
        }
    }
}

fn build_response(
    code: Code,
    accept: ContentFormat,
    response: &SignInResponse,
) -> Result<Message, ServiceError> {
    Message::with_body(code, accept, response).map_err(ServiceError::from)
}

// ── Tests ────────────────────────────────────────────────────────────
