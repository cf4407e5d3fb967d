use std::collections::HashMap;

use log::warn;
use serde::Deserialize;

pub const MAX_SSID_LEN: usize = 32;
pub const MAX_PASSWORD_LEN: usize = 64;

/// One Wi-Fi network record. Built whole and replaced whole; `valid` tracks
/// whether the SSID is non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredCredentials {
    ssid: String,
    password: String,
    valid: bool,
}

impl StoredCredentials {
    /// Oversized fields are cut to their byte bounds on a char boundary.
    pub fn new(ssid: &str, password: &str) -> Self {
        let ssid = bounded(ssid, MAX_SSID_LEN, "ssid");
        let password = bounded(password, MAX_PASSWORD_LEN, "password");
        Self {
            valid: !ssid.is_empty(),
            ssid,
            password,
        }
    }

    pub fn invalid() -> Self {
        Self::default()
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

fn bounded(value: &str, max: usize, field: &str) -> String {
    let cut = truncate_to_bytes(value, max);
    if cut.len() < value.len() {
        warn!(
            "{field} truncated from {} to {} bytes",
            value.len(),
            cut.len()
        );
    }
    cut.to_string()
}

pub fn truncate_to_bytes(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// The network the station radio is currently told to join.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveNetwork {
    pub ssid: Option<String>,
    pub password: Option<String>,
}

impl ActiveNetwork {
    pub fn from_credentials(creds: &StoredCredentials) -> Self {
        let non_empty = |value: &str| (!value.is_empty()).then(|| value.to_string());
        Self {
            ssid: non_empty(creds.ssid()),
            password: non_empty(creds.password()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiMode {
    Station,
    AccessPointStation,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ControlCommand {
    pub cmd: String,
    #[serde(default)]
    pub enable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalRequest {
    pub method: HttpMethod,
    pub path: String,
    pub form: HashMap<String, String>,
}

impl PortalRequest {
    pub fn get(path: &str) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.to_string(),
            form: HashMap::new(),
        }
    }

    pub fn post_form(path: &str, fields: &[(&str, &str)]) -> Self {
        Self {
            method: HttpMethod::Post,
            path: path.to_string(),
            form: fields
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        }
    }

    /// Builds a request from a raw URI and an `application/x-www-form-urlencoded`
    /// body. Query parameters are merged in; body fields win.
    pub fn from_raw(method: HttpMethod, uri: &str, body: &str) -> Self {
        let (path, query) = uri.split_once('?').unwrap_or((uri, ""));
        let mut form = parse_form(query);
        form.extend(parse_form(body));
        Self {
            method,
            path: path.to_string(),
            form,
        }
    }

    /// Missing fields read as empty, like an unset form argument.
    pub fn arg(&self, name: &str) -> &str {
        self.form.get(name).map(String::as_str).unwrap_or("")
    }
}

pub fn parse_form(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(key), percent_decode(value))
        })
        .collect()
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                    (Some(high), Some(low)) => {
                        out.push(high << 4 | low);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            byte => out.push(byte),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_digit(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|digit| digit as u8)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl PortalResponse {
    pub fn html(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/html; charset=utf-8",
            body: body.into(),
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into(),
        }
    }
}
