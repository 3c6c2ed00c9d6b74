//! IPC request dispatch
//!
//! Maps each verb onto the settings store, adapter controller and control
//! state machine. Handlers run on the connection task; the ones that await
//! network or process I/O (apply, switch, test) do so without blocking
//! other clients.

use std::sync::Arc;

use tracing::{debug, warn};

use super::protocol::{ErrorCode, RequestBody, ResponseBody};
use crate::adapter::AdapterController;
use crate::control::{ControlService, TEST_DOMAIN};
use crate::error::ControlError;
use crate::settings::SettingsStore;

/// Dispatches decoded requests to the service components
pub struct IpcHandler {
    settings: Arc<SettingsStore>,
    control: Arc<ControlService>,
    adapters: Arc<AdapterController>,
}

impl IpcHandler {
    /// Wire the handler to its collaborators
    #[must_use]
    pub fn new(
        settings: Arc<SettingsStore>,
        control: Arc<ControlService>,
        adapters: Arc<AdapterController>,
    ) -> Self {
        Self {
            settings,
            control,
            adapters,
        }
    }

    /// Handle one request and produce its response
    pub async fn handle(&self, request: RequestBody) -> ResponseBody {
        debug!(request = ?request, "handling IPC request");

        match request {
            RequestBody::Ping => ResponseBody::Pong,

            RequestBody::GetStatus => {
                ResponseBody::Status(self.control.snapshot().into())
            }

            RequestBody::GetConfig => ResponseBody::Config {
                settings: Box::new(self.settings.snapshot().await),
            },

            RequestBody::SaveConfig { settings } => {
                match self.settings.update(*settings).await {
                    Ok(_) => ResponseBody::ConfigSaved,
                    Err(e) => {
                        warn!(error = %e, "SaveConfig failed");
                        ResponseBody::error(ErrorCode::OperationFailed, e.to_string())
                    }
                }
            }

            RequestBody::GetAdapters { connected_only } => {
                match self.adapters.list(connected_only).await {
                    Ok(adapters) => ResponseBody::Adapters { adapters },
                    Err(e) => ResponseBody::error(ErrorCode::OperationFailed, e.to_string()),
                }
            }

            RequestBody::ApplyProfile { profile, enable } => {
                match self.control.apply_profile(profile, enable).await {
                    Ok(status) => ResponseBody::ProfileApplied { status },
                    Err(e) => Self::control_error(&e),
                }
            }

            RequestBody::ConnectTemporary { provider_id } => {
                let Some(provider) = self.settings.provider_by_id(provider_id).await else {
                    return ResponseBody::error(
                        ErrorCode::NotFound,
                        format!("provider not found: {provider_id}"),
                    );
                };

                match self.control.switch(Arc::new(provider), true).await {
                    Ok(status) => ResponseBody::TemporaryConnected { status },
                    Err(e) => Self::control_error(&e),
                }
            }

            RequestBody::RevertToDefault => match self.control.revert_to_default().await {
                Ok(status) => ResponseBody::RevertedToDefault { status },
                Err(e) => Self::control_error(&e),
            },

            RequestBody::Disable { restore_original_dns } => {
                match self.control.disable(restore_original_dns).await {
                    Ok(report) => ResponseBody::Disabled {
                        restored_adapters: report.updated,
                        failed_adapters: report.failed,
                    },
                    Err(e) => Self::control_error(&e),
                }
            }

            RequestBody::TestProvider {
                provider_id,
                test_domain,
            } => {
                let Some(provider) = self.settings.provider_by_id(provider_id).await else {
                    return ResponseBody::error(
                        ErrorCode::NotFound,
                        format!("provider not found: {provider_id}"),
                    );
                };

                let domain = test_domain.as_deref().unwrap_or(TEST_DOMAIN);
                match self.control.test_provider(&provider, domain).await {
                    Ok(latency_ms) => ResponseBody::TestResult {
                        provider_id,
                        latency_ms,
                    },
                    Err(e) => Self::control_error(&e),
                }
            }

            RequestBody::FlushDnsCache => match self.adapters.flush_cache().await {
                Ok(()) => ResponseBody::CacheFlushed,
                Err(e) => ResponseBody::error(ErrorCode::OperationFailed, e.to_string()),
            },
        }
    }

    fn control_error(error: &ControlError) -> ResponseBody {
        let code = match error {
            ControlError::ProviderNotFound { .. } => ErrorCode::NotFound,
            ControlError::NotRunning { .. } => ErrorCode::NotRunning,
            ControlError::BindFailed { .. }
            | ControlError::TakeoverFailed { .. }
            | ControlError::TestFailed { .. } => ErrorCode::OperationFailed,
        };
        ResponseBody::error(code, error.to_string())
    }
}
