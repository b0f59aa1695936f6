//! Tenant registry.
//!
//! Resolves inbound requests to a `tenant_id` two ways: API key reverse
//! lookup (for tenants that call us directly) and `Webhook-Id` lookup (for
//! MailerCloud, which never sends a key). The webhook bindings are pulled
//! from the ESP's webhook-listing API once at startup; after that the
//! registry is a read-only snapshot for the process lifetime.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_API_URL: &str = "https://cloudapi.mailercloud.com";

const SEARCH_PATH: &str = "/v1/webhooks/search";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },
}

/// Summary counters for startup logging.
#[derive(Debug, Clone, Copy)]
pub struct RegistryStats {
    pub tenants: usize,
    pub webhooks: usize,
}

#[derive(Debug, Default)]
pub struct TenantRegistry {
    // api_key -> tenant_id
    key_to_tenant: HashMap<String, String>,
    // webhook_id -> tenant_id
    webhook_to_tenant: HashMap<String, String>,
    // load order preserved so the ESP sync is deterministic
    tenant_keys: Vec<(String, String)>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from the environment: the packed
    /// `MAILERCLOUD_API_KEYS` list plus any `<NAME>_API_KEY` variable, whose
    /// tenant name is the lowercased prefix.
    pub fn from_env() -> Self {
        let mut registry = Self::new();

        if let Ok(packed) = env::var("MAILERCLOUD_API_KEYS") {
            registry.load_packed(&packed);
        }

        for (name, value) in env::vars() {
            if value.is_empty() {
                continue;
            }
            if let Some(prefix) = name.strip_suffix("_API_KEY") {
                if !prefix.is_empty() {
                    registry.bind_key(prefix.to_lowercase(), value);
                }
            }
        }

        registry
    }

    /// Parse a packed `tenant:key[,tenant:key]*` list. Malformed entries
    /// are logged and skipped.
    pub fn load_packed(&mut self, packed: &str) {
        for entry in packed.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match entry.split_once(':') {
                Some((tenant, key)) if !tenant.is_empty() && !key.is_empty() => {
                    self.bind_key(tenant.to_string(), key.to_string());
                }
                _ => {
                    tracing::warn!(entry, "invalid tenant config entry, skipping");
                }
            }
        }
    }

    pub fn bind_key(&mut self, tenant_id: String, api_key: String) {
        self.key_to_tenant
            .insert(api_key.clone(), tenant_id.clone());
        self.tenant_keys.push((tenant_id, api_key));
    }

    pub fn bind_webhook(&mut self, webhook_id: String, tenant_id: String) {
        self.webhook_to_tenant.insert(webhook_id, tenant_id);
    }

    pub fn tenant_by_key(&self, api_key: &str) -> Option<&str> {
        self.key_to_tenant.get(api_key).map(String::as_str)
    }

    pub fn tenant_by_webhook(&self, webhook_id: &str) -> Option<&str> {
        self.webhook_to_tenant.get(webhook_id).map(String::as_str)
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            tenants: self.tenant_keys.len(),
            webhooks: self.webhook_to_tenant.len(),
        }
    }

    /// Query the ESP's webhook-listing endpoint with every tenant key and
    /// bind each returned webhook id to its owner. Per-tenant failures are
    /// logged and skipped; a missing binding only means the ingress falls
    /// back to the raw webhook id later.
    ///
    /// Returns the number of bindings created.
    pub async fn sync_bindings(&mut self, base_url: &str) -> usize {
        let client = match reqwest::Client::builder().timeout(HTTP_TIMEOUT).build() {
            Ok(client) => client,
            Err(e) => {
                tracing::error!(error = %e, "failed to build HTTP client for webhook sync");
                return 0;
            }
        };

        let mut bound = 0;
        for (tenant_id, api_key) in self.tenant_keys.clone() {
            match fetch_webhooks(&client, base_url, &api_key).await {
                Ok(webhooks) => {
                    for webhook in webhooks {
                        tracing::info!(
                            webhook_id = %webhook.id,
                            tenant_id = %tenant_id,
                            webhook_name = %webhook.name,
                            "bound webhook to tenant"
                        );
                        self.bind_webhook(webhook.id, tenant_id.clone());
                        bound += 1;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        tenant_id = %tenant_id,
                        error = %e,
                        "failed to fetch webhook registrations"
                    );
                }
            }
        }
        bound
    }
}

#[derive(Debug, Serialize)]
struct SearchWebhooksRequest {
    limit: u32,
    page: u32,
    search: String,
    sort_field: String,
    sort_order: String,
}

#[derive(Debug, Deserialize)]
pub struct WebhookRegistration {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct WebhookList {
    #[serde(default)]
    data: Vec<WebhookRegistration>,
}

async fn fetch_webhooks(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
) -> Result<Vec<WebhookRegistration>, RegistryError> {
    let request = SearchWebhooksRequest {
        limit: 100,
        page: 1,
        search: String::new(),
        sort_field: "name".to_string(),
        sort_order: "asc".to_string(),
    };

    let response = client
        .post(format!("{base_url}{SEARCH_PATH}"))
        .header("Authorization", api_key)
        .header("Accept", "application/json")
        .json(&request)
        .send()
        .await
        .map_err(|e| RegistryError::Http(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(RegistryError::Api {
            status: status.as_u16(),
            message,
        });
    }

    let list: WebhookList = response
        .json()
        .await
        .map_err(|e| RegistryError::Http(e.to_string()))?;

    Ok(list.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_packed_list_parsing() {
        let mut registry = TenantRegistry::new();
        registry.load_packed("acme:key-a,globex:key-g");

        assert_eq!(registry.tenant_by_key("key-a"), Some("acme"));
        assert_eq!(registry.tenant_by_key("key-g"), Some("globex"));
        assert_eq!(registry.tenant_by_key("missing"), None);
        assert_eq!(registry.stats().tenants, 2);
    }

    #[test]
    fn test_malformed_packed_entries_skipped() {
        let mut registry = TenantRegistry::new();
        registry.load_packed("acme:key-a,broken,:nokey,notenant:,  ,globex:key-g");

        assert_eq!(registry.stats().tenants, 2);
        assert_eq!(registry.tenant_by_key("key-a"), Some("acme"));
        assert_eq!(registry.tenant_by_key("key-g"), Some("globex"));
    }

    #[test]
    fn test_webhook_binding_lookup() {
        let mut registry = TenantRegistry::new();
        registry.bind_webhook("wh_1".to_string(), "acme".to_string());

        assert_eq!(registry.tenant_by_webhook("wh_1"), Some("acme"));
        assert_eq!(registry.tenant_by_webhook("wh_2"), None);
    }

    #[test]
    #[serial]
    fn test_env_suffix_bindings() {
        std::env::remove_var("MAILERCLOUD_API_KEYS");
        std::env::set_var("ACME_API_KEY", "env-key-acme");

        let registry = TenantRegistry::from_env();
        assert_eq!(registry.tenant_by_key("env-key-acme"), Some("acme"));

        std::env::remove_var("ACME_API_KEY");
    }

    #[test]
    #[serial]
    fn test_env_packed_and_suffix_combined() {
        std::env::set_var("MAILERCLOUD_API_KEYS", "acme:packed-key");
        std::env::set_var("GLOBEX_API_KEY", "suffix-key");

        let registry = TenantRegistry::from_env();
        assert_eq!(registry.tenant_by_key("packed-key"), Some("acme"));
        assert_eq!(registry.tenant_by_key("suffix-key"), Some("globex"));

        std::env::remove_var("MAILERCLOUD_API_KEYS");
        std::env::remove_var("GLOBEX_API_KEY");
    }
}
