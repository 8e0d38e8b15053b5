//! Pending-command bridging: backend commands executed on the device.
//!
//! Every pending event is settled with exactly one confirmation
//! carrying its correlation id, whether the device answered, the
//! request could not be built, or the device was unreachable. Only an
//! invalid authorization context skips the confirmation: the connection
//! closes and the command stays pending for the next connection.

use async_trait::async_trait;

use stratus_proto::{Code, ContentFormat, DeviceRequest, Href, Method, ProtoError, STATUS_HREF};

use crate::auth::CallContext;
use crate::backend::{
    ConfirmDeviceMetadataUpdateRequest, ConfirmKind, ConfirmResourceRequest, Content,
    DeviceMetadataUpdate, PendingCommand, ResourceCommand, ResourceLink, ShadowSynchronization,
    UnpublishResourceLinksRequest,
};
use crate::error::ServiceError;
use crate::session::Session;
use crate::subscriber::SubscriberHandler;

impl Session {
    /// Execute one backend command against the device. Normally driven
    /// by the device subscriber; callable directly by embedders that
    /// source commands elsewhere.
    pub async fn handle_pending_command(&self, command: PendingCommand) {
        match command {
            PendingCommand::ResourceCreatePending(cmd) => {
                self.execute_resource_command(ConfirmKind::Create, cmd).await;
            }
            PendingCommand::ResourceRetrievePending(cmd) => {
                self.execute_resource_command(ConfirmKind::Retrieve, cmd).await;
            }
            PendingCommand::ResourceUpdatePending(cmd) => {
                self.execute_resource_command(ConfirmKind::Update, cmd).await;
            }
            PendingCommand::ResourceDeletePending(cmd) => {
                self.execute_resource_command(ConfirmKind::Delete, cmd).await;
            }
            PendingCommand::DeviceMetadataUpdatePending(update) => {
                self.handle_metadata_update(update).await;
            }
        }
    }

    async fn execute_resource_command(&self, kind: ConfirmKind, command: ResourceCommand) {
        let auth = match self.auth_context() {
            Ok(auth) => auth,
            Err(err) => {
                // No confirmation: the command stays pending for a
                // healthy connection.
                self.close_on(&err);
                return;
            }
        };
        let ctx = auth.call_context();

        // The cloud-status pseudo-resource exists only as the session's
        // anchor; commands against it never reach the device.
        if command.resource_id.href == STATUS_HREF {
            let code = match kind {
                ConfirmKind::Retrieve => Code::Content,
                ConfirmKind::Update => Code::MethodNotAllowed,
                ConfirmKind::Create | ConfirmKind::Delete => Code::Forbidden,
            };
            self.confirm(&ctx, kind, &command, code, Content::default()).await;
            return;
        }

        let request = match build_device_request(
            kind,
            &command,
            self.gateway.config.keep_alive_timeout,
        ) {
            Ok(request) => request,
            Err(err) => {
                self.confirm(
                    &ctx,
                    kind,
                    &command,
                    Code::BadRequest,
                    text_content(&err.to_string()),
                )
                .await;
                return;
            }
        };

        let response = match self.transport.request(request).await {
            Ok(response) => response,
            Err(err) => {
                let err = ServiceError::from(err);
                tracing::warn!(
                    resource = %command.resource_id,
                    kind = %kind,
                    error = %err,
                    "device request failed"
                );
                self.confirm(
                    &ctx,
                    kind,
                    &command,
                    Code::ServiceUnavailable,
                    text_content(&err.to_string()),
                )
                .await;
                return;
            }
        };

        // A resource the device no longer has must disappear from the
        // backend's published links before the failure is confirmed.
        if response.code == Code::NotFound {
            self.unpublish(&ctx, &command.resource_id.device_id, &command.resource_id.href)
                .await;
        }

        self.confirm(&ctx, kind, &command, response.code, Content::from(&response))
            .await;
    }

    async fn confirm(
        &self,
        ctx: &CallContext,
        kind: ConfirmKind,
        command: &ResourceCommand,
        code: Code,
        content: Content,
    ) {
        let request = ConfirmResourceRequest {
            kind,
            resource_id: command.resource_id.clone(),
            correlation_id: command.correlation_id.clone(),
            code,
            content,
            metadata: self.metadata(),
        };
        if let Err(err) = self.gateway.backend.confirm_resource(ctx, request).await {
            tracing::error!(
                resource = %command.resource_id,
                correlation_id = %command.correlation_id,
                error = %err,
                "confirming resource command failed"
            );
        }
    }

    async fn unpublish(&self, ctx: &CallContext, device_id: &str, href: &str) {
        let request = UnpublishResourceLinksRequest {
            device_id: device_id.to_owned(),
            hrefs: vec![href.to_owned()],
            metadata: self.metadata(),
        };
        if let Err(err) = self.gateway.backend.unpublish_resource_links(ctx, request).await {
            tracing::warn!(
                device_id = %device_id,
                href = %href,
                error = %err,
                "unpublishing vanished resource failed"
            );
        }
    }

    /// Toggle shadow synchronization: swap the observer accordingly,
    /// confirm, and swap back if the confirmation is refused.
    async fn handle_metadata_update(&self, update: DeviceMetadataUpdate) {
        let auth = match self.auth_context() {
            Ok(auth) => auth,
            Err(err) => {
                self.close_on(&err);
                return;
            }
        };
        let ctx = auth.call_context();

        let previous = match self.current_observer_cell() {
            Some(cell) => match cell.get().await {
                Ok(observer) => Some(observer.shadow_synchronization()),
                Err(_) => None,
            },
            None => None,
        };

        let replaced = match self.replace_observer(false, Some(update.shadow_synchronization)) {
            Ok(cell) => cell,
            Err(err) => {
                self.close_on(&err);
                return;
            }
        };
        if let Err(err) = replaced.get().await {
            // The command stays pending; a reconnect gets a fresh try.
            self.close_on(&err);
            return;
        }

        let request = ConfirmDeviceMetadataUpdateRequest {
            device_id: update.device_id.clone(),
            correlation_id: update.correlation_id.clone(),
            shadow_synchronization: update.shadow_synchronization,
            metadata: self.metadata(),
        };
        if let Err(err) = self
            .gateway
            .backend
            .confirm_device_metadata_update(&ctx, request)
            .await
        {
            tracing::error!(
                device_id = %update.device_id,
                correlation_id = %update.correlation_id,
                error = %err,
                "confirming metadata update failed, rolling observer back"
            );
            let rollback = previous.unwrap_or(ShadowSynchronization::Enabled);
            if let Err(err) = self.replace_observer(false, Some(rollback)) {
                self.close_on(&err);
            }
        }
    }
}

fn build_device_request(
    kind: ConfirmKind,
    command: &ResourceCommand,
    timeout: std::time::Duration,
) -> Result<DeviceRequest, ServiceError> {
    let method = match kind {
        ConfirmKind::Retrieve => Method::Get,
        ConfirmKind::Create | ConfirmKind::Update => Method::Post,
        ConfirmKind::Delete => Method::Delete,
    };

    let href = match &command.resource_interface {
        Some(interface) if !interface.is_empty() => {
            format!("{}?if={interface}", command.resource_id.href)
        }
        _ => command.resource_id.href.clone(),
    };

    let mut request = DeviceRequest::new(method, href, timeout);
    match kind {
        ConfirmKind::Create | ConfirmKind::Update => {
            let content = command.content.as_ref().ok_or_else(|| {
                ServiceError::from(ProtoError::InvalidRequest(format!(
                    "{kind} of {} carries no content",
                    command.resource_id
                )))
            })?;
            request = request.with_payload(
                content.content_format.unwrap_or(ContentFormat::Json),
                content.data.clone(),
            );
        }
        ConfirmKind::Retrieve | ConfirmKind::Delete => {}
    }
    Ok(request)
}

/// `text/plain` body for synthesized failure confirmations.
fn text_content(text: &str) -> Content {
    Content {
        content_format: Some(ContentFormat::Text),
        data: bytes::Bytes::copy_from_slice(text.as_bytes()),
    }
}

// ── Subscriber plumbing ──────────────────────────────────────────────

#[async_trait]
impl SubscriberHandler for Session {
    fn call_context(&self) -> Option<CallContext> {
        self.current_call_context()
    }

    async fn handle_command(&self, command: PendingCommand) {
        self.handle_pending_command(command).await;
    }

    async fn handle_links_published(&self, links: Vec<ResourceLink>) {
        if let Err(err) = self.resources_published(&links).await {
            tracing::warn!(error = %err, "observing published resources failed");
        }
    }

    async fn handle_links_unpublished(&self, hrefs: Vec<Href>) {
        self.resources_unpublished(&hrefs).await;
    }

    fn on_reconnect_exhausted(&self, error: &ServiceError) {
        self.close_on(error);
    }
}

// ── Tests ────────────────────────────────────────────────────────────
