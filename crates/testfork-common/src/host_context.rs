// HostContext: process-wide services shared by every dispatcher in a build.

use crate::config_store::DispatcherSettings;
use crate::constants::variables;
use crate::documentation::DocumentationRegistry;
use crate::lease::WorkerLeaseRegistry;
use crate::tracing::{TraceManager, TraceSetting, Tracing};

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use testfork_sdk::{StringUtil, TraceWriter};
use tokio_util::sync::CancellationToken;

/// Why the host is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl-C or SIGTERM.
    UserCancelled,
    /// Another part of the build failed and running workers should be killed.
    BuildFailure,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::UserCancelled => write!(f, "UserCancelled"),
            ShutdownReason::BuildFailure => write!(f, "BuildFailure"),
        }
    }
}

/// Process-wide context: settings, trace sources, the worker lease registry,
/// the documentation registry and the shutdown signal.
pub struct HostContext {
    host_type: String,
    settings: DispatcherSettings,
    trace_manager: TraceManager,
    lease_registry: Arc<WorkerLeaseRegistry>,
    documentation: DocumentationRegistry,
    shutdown_token: CancellationToken,
    shutdown_reason: Mutex<Option<ShutdownReason>>,
}

impl HostContext {
    /// Create a context. `host_type` names the process in logs
    /// (`"Dispatcher"` or `"Worker"`).
    pub fn new(host_type: impl Into<String>, settings: DispatcherSettings) -> Result<Arc<Self>> {
        let host_type = host_type.into();
        anyhow::ensure!(!host_type.is_empty(), "host_type must not be empty");

        let trace_setting = TraceSetting {
            print_to_stdout: StringUtil::env_flag(variables::PRINT_LOG_TO_STDOUT).unwrap_or(false),
            ..TraceSetting::default()
        };
        let documentation = DocumentationRegistry::new(&settings.documentation_url)?;
        let lease_registry = WorkerLeaseRegistry::new(settings.max_workers);

        Ok(Arc::new(Self {
            host_type,
            settings,
            trace_manager: TraceManager::with_setting(trace_setting),
            lease_registry,
            documentation,
            shutdown_token: CancellationToken::new(),
            shutdown_reason: Mutex::new(None),
        }))
    }

    pub fn host_type(&self) -> &str {
        &self.host_type
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    /// Get a trace source for the given component name.
    pub fn get_trace(&self, name: &str) -> Tracing {
        self.trace_manager.get(name)
    }

    pub fn lease_registry(&self) -> &Arc<WorkerLeaseRegistry> {
        &self.lease_registry
    }

    pub fn documentation(&self) -> &DocumentationRegistry {
        &self.documentation
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Token cancelled when the host starts shutting down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        *self.shutdown_reason.lock()
    }

    /// Initiate shutdown. Only the first reason is recorded. Pending and
    /// future worker leases fail; held ones stay valid until released.
    pub fn shutdown(&self, reason: ShutdownReason) {
        {
            let mut current = self.shutdown_reason.lock();
            if current.is_some() {
                return;
            }
            *current = Some(reason);
        }
        self.get_trace("HostContext")
            .info(&format!("{} will shut down for {}", self.host_type, reason));
        self.lease_registry.close();
        self.shutdown_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_registry_follows_settings() {
        let settings = DispatcherSettings {
            max_workers: 3,
            ..DispatcherSettings::default()
        };
        let context = HostContext::new("Dispatcher", settings).unwrap();
        assert_eq!(context.lease_registry().max_workers(), 3);
        assert_eq!(context.host_type(), "Dispatcher");
    }

    #[test]
    fn first_shutdown_reason_wins() {
        let context = HostContext::new("Dispatcher", DispatcherSettings::default()).unwrap();
        let token = context.shutdown_token();
        assert!(!token.is_cancelled());

        context.shutdown(ShutdownReason::BuildFailure);
        context.shutdown(ShutdownReason::UserCancelled);
        assert!(token.is_cancelled());
        assert_eq!(context.shutdown_reason(), Some(ShutdownReason::BuildFailure));
    }

    #[tokio::test]
    async fn shutdown_closes_the_lease_registry() {
        let context = HostContext::new("Dispatcher", DispatcherSettings::default()).unwrap();
        let root = context.lease_registry().root_lease();
        context.shutdown(ShutdownReason::UserCancelled);
        assert!(matches!(
            root.start_child().await,
            Err(crate::lease::LeaseError::Closed)
        ));
    }

    #[test]
    fn empty_host_type_is_rejected() {
        assert!(HostContext::new("", DispatcherSettings::default()).is_err());
    }

    #[test]
    fn bad_documentation_url_is_rejected() {
        let settings = DispatcherSettings {
            documentation_url: "::".into(),
            ..DispatcherSettings::default()
        };
        assert!(HostContext::new("Dispatcher", settings).is_err());
    }
}
