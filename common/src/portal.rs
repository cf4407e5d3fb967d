use log::{info, warn};
use thiserror::Error;

use crate::{
    config::PortalConfig,
    credentials::CredentialStore,
    dns::DNS_PORT,
    hal::{DnsResponder, HttpServer, PlatformError, Storage, WifiDriver},
    types::{
        HttpMethod, PortalRequest, PortalResponse, StoredCredentials, WifiMode, MAX_PASSWORD_LEN,
        MAX_SSID_LEN,
    },
};

pub const PROVISIONING_AP_SSID: &str = "esp-sta";
pub const SUBMIT_PATH: &str = "/submit";
pub const DEFAULT_MAINTENANCE_PHONE: &str = "N/A";
pub const DEFAULT_USER_MANUAL_URL: &str = "http://www.readme.com";

const SUBMIT_OK_HTML: &str = "<html><body><h2>Saved</h2>\
<p>The device is joining the new Wi-Fi network. You can leave this hotspot now.</p>\
</body></html>";

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Invalid SSID or password length.")]
    InvalidLength,
    #[error("Failed to save credentials.")]
    Persist(#[source] PlatformError),
}

impl SubmitError {
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidLength => 400,
            Self::Persist(_) => 500,
        }
    }
}

/// Trimmed, bounds-checked form input. Bounds are in bytes.
pub fn validate_submission(ssid: &str, password: &str) -> Result<StoredCredentials, SubmitError> {
    let ssid = ssid.trim();
    let password = password.trim();
    if ssid.is_empty() || ssid.len() > MAX_SSID_LEN || password.len() > MAX_PASSWORD_LEN {
        return Err(SubmitError::InvalidLength);
    }
    Ok(StoredCredentials::new(ssid, password))
}

/// Temporary access point plus captive portal. Holds at most one submitted
/// record until the controller consumes it.
pub struct ProvisioningManager<H: HttpServer, D: DnsResponder> {
    http: H,
    dns: D,
    page: PortalConfig,
    active: bool,
    pending: StoredCredentials,
    has_pending: bool,
}

impl<H: HttpServer, D: DnsResponder> ProvisioningManager<H, D> {
    pub fn new(http: H, dns: D, page: PortalConfig) -> Self {
        Self {
            http,
            dns,
            page,
            active: false,
            pending: StoredCredentials::invalid(),
            has_pending: false,
        }
    }

    pub fn begin<W: WifiDriver>(&mut self, wifi: &mut W) -> Result<(), PlatformError> {
        if self.active {
            return Ok(());
        }

        wifi.stop_access_point();
        wifi.set_mode(WifiMode::AccessPointStation)?;
        wifi.start_access_point(PROVISIONING_AP_SSID)?;
        if let Err(err) = self.http.start() {
            wifi.stop_access_point();
            return Err(err);
        }
        let portal_ip = wifi.access_point_ip();
        if let Err(err) = self.dns.start(DNS_PORT, portal_ip) {
            warn!("captive DNS unavailable, portal reachable by address only: {err}");
        }

        self.active = true;
        self.has_pending = false;
        self.pending = StoredCredentials::invalid();
        info!("provisioning AP `{PROVISIONING_AP_SSID}` started");
        info!("connect and visit http://{portal_ip}");
        Ok(())
    }

    pub fn stop<W: WifiDriver>(&mut self, wifi: &mut W) {
        if !self.active {
            return;
        }
        self.dns.stop();
        self.http.stop();
        wifi.stop_access_point();
        self.active = false;
        info!("provisioning stopped");
    }

    /// Services pending DNS and HTTP traffic. A saved submission tears the
    /// portal down before returning.
    pub fn service<W: WifiDriver, S: Storage>(
        &mut self,
        wifi: &mut W,
        store: &mut CredentialStore<S>,
        device_id: &str,
    ) {
        if !self.active {
            return;
        }

        self.dns.process_next_request();

        let Self {
            http,
            page,
            pending,
            has_pending,
            ..
        } = self;
        let mut accepted = false;
        http.handle_client(&mut |request| match (request.method, request.path.as_str()) {
            (HttpMethod::Post, SUBMIT_PATH) => {
                match Self::handle_submit(request, store, pending) {
                    Ok(()) => {
                        accepted = true;
                        PortalResponse::html(200, SUBMIT_OK_HTML)
                    }
                    Err(err) => {
                        warn!("portal submission rejected: {err}");
                        PortalResponse::text(err.status(), err.to_string())
                    }
                }
            }
            _ => PortalResponse::html(200, render_page(page, device_id)),
        });

        if accepted {
            *has_pending = true;
            info!("new credentials received for `{}`", pending.ssid());
            self.stop(wifi);
        }
    }

    fn handle_submit<S: Storage>(
        request: &PortalRequest,
        store: &mut CredentialStore<S>,
        pending: &mut StoredCredentials,
    ) -> Result<(), SubmitError> {
        let creds = validate_submission(request.arg("ssid"), request.arg("password"))?;
        *pending = creds;
        store.save(pending).map_err(SubmitError::Persist)
    }

    pub fn is_provisioning(&self) -> bool {
        self.active
    }

    pub fn has_new_credentials(&self) -> bool {
        self.has_pending
    }

    /// Clears the mailbox flag and hands back the last submitted record.
    pub fn consume_credentials(&mut self) -> StoredCredentials {
        self.has_pending = false;
        self.pending.clone()
    }
}

pub fn render_page(page: &PortalConfig, device_id: &str) -> String {
    let phone = page
        .maintenance_phone
        .as_deref()
        .unwrap_or(DEFAULT_MAINTENANCE_PHONE);
    let manual = page
        .user_manual_url
        .as_deref()
        .unwrap_or(DEFAULT_USER_MANUAL_URL);

    format!(
        r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Device Network Setup</title>
  <style>
    body{{font-family:Arial,sans-serif;background:#f0f2f5;max-width:420px;margin:2rem auto;padding:0 1rem;color:#333}}
    .card{{background:#fff;border-top:4px solid #0056b3;border-radius:8px;padding:1.5rem;box-shadow:0 4px 12px rgba(0,0,0,.1)}}
    h1{{font-size:1.2rem;color:#0056b3;margin:0 0 1rem}}.info{{background:#eef6fc;border-radius:4px;padding:.8rem;font-size:.9rem}}
    label{{display:block;margin:.8rem 0 .2rem;font-weight:600}}input{{width:100%;padding:.6rem;box-sizing:border-box}}
    button{{width:100%;margin-top:1rem;padding:.7rem;background:#0056b3;color:#fff;border:0;border-radius:4px}}
    .muted{{color:#666;font-size:.8rem;text-align:center}}
  </style>
</head>
<body>
  <div class="card">
    <h1>Device Network Setup</h1>
    <div class="info">
      <div>Maintenance phone: {phone}</div>
      <div>User manual: <a href="{manual}" target="_blank">open</a></div>
    </div>
    <form method="POST" action="{SUBMIT_PATH}">
      <label for="ssid">Wi-Fi name (SSID)</label><input type="text" id="ssid" name="ssid" required>
      <label for="password">Wi-Fi password</label><input type="password" id="password" name="password">
      <button type="submit">Save and connect</button>
    </form>
    <p class="muted">Use a 2.4 GHz network.</p>
    <p class="muted">Device ID: {device_id}</p>
  </div>
</body>
</html>
"#,
        phone = escape_html(phone),
        manual = escape_html(manual),
        device_id = escape_html(device_id),
    )
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
