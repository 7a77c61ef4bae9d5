//! Locally answered endpoints: status page, health check, descriptor.

use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use serde::Serialize;

use super::backend::BackendLink;
use super::request::LocalRoute;
use crate::descriptor::DescriptorBuilder;

/// Body of the status page.
pub const STATUS_BODY: &str = "System Online";

/// A fully materialized local response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: Bytes,
}

impl LocalResponse {
    fn text(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into(),
        }
    }

    /// Bare status response carrying only the canonical reason.
    pub fn status_only(status: StatusCode) -> Self {
        Self::text(status, status.canonical_reason().unwrap_or("error").to_string())
    }
}

#[derive(Debug, Serialize)]
struct HealthBody<'a> {
    status: &'a str,
    backend: &'a str,
}

/// Handlers for everything the front door serves without relaying.
pub struct LocalHandlers {
    descriptor: DescriptorBuilder,
    backend: Arc<dyn BackendLink>,
}

impl LocalHandlers {
    pub fn new(descriptor: DescriptorBuilder, backend: Arc<dyn BackendLink>) -> Self {
        Self {
            descriptor,
            backend,
        }
    }

    pub fn respond(&self, route: LocalRoute) -> LocalResponse {
        match route {
            LocalRoute::Status => LocalResponse::text(StatusCode::OK, STATUS_BODY),
            LocalRoute::Health => self.health(),
            LocalRoute::Descriptor => LocalResponse::text(StatusCode::OK, self.descriptor.encoded()),
            LocalRoute::NotFound => LocalResponse::status_only(StatusCode::NOT_FOUND),
        }
    }

    fn health(&self) -> LocalResponse {
        let available = self.backend.is_available();
        let body = HealthBody {
            status: if available { "ok" } else { "degraded" },
            backend: self.backend.status(),
        };
        let status = if available {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };

        // Serializing two string fields cannot fail.
        let body = serde_json::to_vec(&body).unwrap_or_default();
        LocalResponse {
            status,
            content_type: "application/json",
            body: Bytes::from(body),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::sync::watch;

    use super::*;
    use crate::config::Config;

    struct DownBackend;

    impl BackendLink for DownBackend {
        fn endpoint(&self) -> SocketAddr {
            "127.0.0.1:1".parse().unwrap()
        }

        fn is_available(&self) -> bool {
            false
        }
    }

    fn handlers(backend: Arc<dyn BackendLink>) -> LocalHandlers {
        let config = Config::from_lookup(|_| None).unwrap();
        let (_tx, rx) = watch::channel(Some("edge.example.com".to_string()));
        LocalHandlers::new(DescriptorBuilder::new(&config, rx), backend)
    }

    #[test]
    fn test_status_and_not_found() {
        let local = handlers(Arc::new(DownBackend));
        assert_eq!(local.respond(LocalRoute::Status).body, STATUS_BODY);
        assert_eq!(
            local.respond(LocalRoute::NotFound).status,
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_health_reflects_backend() {
        let local = handlers(Arc::new(DownBackend));
        let response = local.respond(LocalRoute::Health);
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);

        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["backend"], "unavailable");
    }

    #[test]
    fn test_descriptor_is_base64() {
        let local = handlers(Arc::new(DownBackend));
        let response = local.respond(LocalRoute::Descriptor);
        assert_eq!(response.status, StatusCode::OK);
        assert!(response
            .body
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=')));
    }
}
