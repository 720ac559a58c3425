//! Callback URL templating for the built-in console and my-account applications.
//!
//! Their callbacks are stored with the origin replaced by a placeholder so a
//! change of server origin needs no data migration. The placeholder is filled
//! with the configured origin when the application is read back.

use crate::config::RegistrySettings;
use url::Url;

pub const CONSOLE_ORIGIN_PLACEHOLDER: &str = "{{console.origin}}";
pub const MY_ACCOUNT_ORIGIN_PLACEHOLDER: &str = "{{myaccount.origin}}";
pub const TENANT_DOMAIN_PLACEHOLDER: &str = "{tenant_domain}";

const REGEXP_PREFIX: &str = "regexp=";

/// Applications shipped with the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstPartyApp {
    Console,
    MyAccount,
}

impl FirstPartyApp {
    /// Match an application name against the configured first-party names.
    pub fn detect(application_name: &str, settings: &RegistrySettings) -> Option<Self> {
        if application_name.eq_ignore_ascii_case(&settings.console_app_name) {
            Some(FirstPartyApp::Console)
        } else if application_name.eq_ignore_ascii_case(&settings.my_account_app_name) {
            Some(FirstPartyApp::MyAccount)
        } else {
            None
        }
    }

    pub fn placeholder(&self) -> &'static str {
        match self {
            FirstPartyApp::Console => CONSOLE_ORIGIN_PLACEHOLDER,
            FirstPartyApp::MyAccount => MY_ACCOUNT_ORIGIN_PLACEHOLDER,
        }
    }

    fn origin<'a>(&self, settings: &'a RegistrySettings) -> &'a str {
        let configured = match self {
            FirstPartyApp::Console => settings.console_origin.as_deref(),
            FirstPartyApp::MyAccount => settings.my_account_origin.as_deref(),
        };
        configured.unwrap_or(&settings.server_origin)
    }

    /// Replace the origin of the callback with this app's placeholder.
    ///
    /// Callbacks without a recognizable origin are returned unchanged.
    pub fn template_callback(&self, callback: &str) -> String {
        match callback_origin(callback) {
            Some(origin) => callback.replace(&origin, self.placeholder()),
            None => callback.to_string(),
        }
    }

    /// Fill the placeholder of a stored callback with the configured origin.
    pub fn resolve_callback(&self, stored: &str, settings: &RegistrySettings) -> String {
        stored.replace(self.placeholder(), self.origin(settings))
    }

    /// Live callback from server configuration for a root organization.
    pub fn server_callback(&self, settings: &RegistrySettings, tenant_domain: &str) -> Option<String> {
        let configured = match self {
            FirstPartyApp::Console => settings.console_callback_url.as_deref(),
            FirstPartyApp::MyAccount => settings.my_account_callback_url.as_deref(),
        };
        configured
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(|c| c.replace(TENANT_DOMAIN_PLACEHOLDER, tenant_domain))
    }
}

/// Origin of the first URL in a callback, which may be a `regexp=(a|b)` pattern.
fn callback_origin(callback: &str) -> Option<String> {
    let candidate = callback
        .strip_prefix(REGEXP_PREFIX)
        .unwrap_or(callback)
        .trim_start_matches('(');
    let end = candidate
        .find(|c: char| c == '|' || c == ')')
        .unwrap_or(candidate.len());
    let url = Url::parse(&candidate[..end]).ok()?;
    let origin = url.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}
