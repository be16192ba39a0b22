//! Daily quota and credential gate.
//!
//! The gate runs before any network call. A configured credential (access
//! password or a bring-your-own LLM config) lifts the cap entirely; without
//! one the client may make `daily_limit` requests per calendar day.
//!
//! Consumption is two-phase: [`CredentialGate::ensure_quota_available`] is
//! checked before sending, and [`CredentialGate::check_and_consume_quota`]
//! is applied after the server answered, honoring its exemption signal.
//! The counter lives in the client's state file only, so two clients sharing
//! one quota can drift apart.

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{NexusError, Result};
use crate::providers::LlmConfig;

pub const DEFAULT_DAILY_LIMIT: u32 = 10;

pub const ACCESS_PASSWORD_HEADER: &str = "X-Access-Password";
pub const CUSTOM_LLM_HEADER: &str = "X-Custom-LLM";
pub const QUOTA_EXEMPT_HEADER: &str = "X-Quota-Exempt";

fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Free-request counter for one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    used_count: u32,
    daily_limit: u32,
    reset_boundary: NaiveDate,
}

impl QuotaState {
    /// A `daily_limit` of zero is raised to one.
    pub fn new(daily_limit: u32, today: NaiveDate) -> Self {
        Self {
            used_count: 0,
            daily_limit: daily_limit.max(1),
            reset_boundary: today,
        }
    }

    /// Zero the counter when `today` is past the stored day.
    pub fn roll_over(&mut self, today: NaiveDate) {
        if today != self.reset_boundary {
            self.used_count = 0;
            self.reset_boundary = today;
        }
    }

    pub fn has_remaining(&mut self, today: NaiveDate) -> bool {
        self.roll_over(today);
        self.used_count < self.daily_limit
    }

    /// Count one request. Saturates; callers check [`Self::has_remaining`] first.
    pub fn consume(&mut self, today: NaiveDate) {
        self.roll_over(today);
        self.used_count = self.used_count.saturating_add(1);
    }

    pub fn used_count(&self) -> u32 {
        self.used_count
    }

    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    pub fn set_daily_limit(&mut self, limit: u32) {
        self.daily_limit = limit.max(1);
    }

    pub fn reset_boundary(&self) -> NaiveDate {
        self.reset_boundary
    }
}

/// Locally stored credentials. The password wins when both are set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    llm_config: Option<LlmConfig>,
}

impl Credentials {
    pub fn access_password(&self) -> Option<&str> {
        self.access_password.as_deref().filter(|p| !p.is_empty())
    }

    pub fn set_access_password(&mut self, password: impl Into<String>) {
        let password = password.into();
        self.access_password = if password.trim().is_empty() { None } else { Some(password.trim().to_string()) };
    }

    pub fn clear_access_password(&mut self) {
        self.access_password = None;
    }

    /// The LLM config, only when it carries an api key.
    pub fn llm_config(&self) -> Option<&LlmConfig> {
        self.llm_config.as_ref().filter(|c| c.is_active())
    }

    pub fn set_llm_config(&mut self, config: LlmConfig) {
        self.llm_config = Some(config);
    }

    pub fn clear_llm_config(&mut self) {
        self.llm_config = None;
    }

    pub fn has_access_password(&self) -> bool {
        self.access_password().is_some()
    }

    pub fn has_llm_config(&self) -> bool {
        self.llm_config().is_some()
    }

    /// Whether requests made with these credentials are uncapped.
    pub fn has_any(&self) -> bool {
        self.has_access_password() || self.has_llm_config()
    }
}

/// Quota counter plus credentials; decides whether a request may go out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialGate {
    quota: QuotaState,
    credentials: Credentials,
}

impl Default for CredentialGate {
    fn default() -> Self {
        Self::new(DEFAULT_DAILY_LIMIT)
    }
}

impl CredentialGate {
    pub fn new(daily_limit: u32) -> Self {
        Self {
            quota: QuotaState::new(daily_limit, today()),
            credentials: Credentials::default(),
        }
    }

    pub fn with_state(quota: QuotaState, credentials: Credentials) -> Self {
        Self { quota, credentials }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn credentials_mut(&mut self) -> &mut Credentials {
        &mut self.credentials
    }

    pub fn quota(&self) -> &QuotaState {
        &self.quota
    }

    pub fn quota_mut(&mut self) -> &mut QuotaState {
        &mut self.quota
    }

    /// Pre-flight check. Always passes when any credential is configured.
    pub fn ensure_quota_available(&mut self) -> Result<()> {
        if self.credentials.has_any() {
            return Ok(());
        }
        if !self.quota.has_remaining(today()) {
            tracing::debug!(used = self.quota.used_count, limit = self.quota.daily_limit, "quota exhausted");
            return Err(NexusError::QuotaExceeded {
                used: self.quota.used_count,
                limit: self.quota.daily_limit,
            });
        }
        Ok(())
    }

    /// Post-response accounting. `exempt` is the server's `X-Quota-Exempt`
    /// verdict; when absent or false the request counts against the quota.
    pub fn check_and_consume_quota(&mut self, exempt: bool) {
        if exempt {
            return;
        }
        self.quota.consume(today());
    }

    /// Same as [`Self::check_and_consume_quota`], reading the header value.
    pub fn consume_from_header(&mut self, header: Option<&str>) {
        self.check_and_consume_quota(header == Some("true"));
    }

    /// Credential headers for `/api/chat` and `/api/models`.
    pub fn request_headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::new();
        if let Some(password) = self.credentials.access_password() {
            headers.push((ACCESS_PASSWORD_HEADER, password.to_string()));
        }
        if self.credentials.has_llm_config() {
            headers.push((CUSTOM_LLM_HEADER, "true".to_string()));
        }
        headers
    }

    pub fn used(&self) -> u32 {
        self.quota.used_count
    }

    pub fn limit(&self) -> u32 {
        self.quota.daily_limit
    }

    pub fn remaining(&self) -> u32 {
        self.quota.daily_limit.saturating_sub(self.quota.used_count)
    }

    /// Re-evaluate the day boundary, e.g. right after loading saved state.
    pub fn refresh(&mut self) {
        self.quota.roll_over(today());
    }
}
