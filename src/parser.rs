//! Descriptor string -> [`NodeDescriptor`].
//!
//! `vmess://` carries a base64 JSON record; every other recognised scheme is
//! a plain URI with the endpoint in the authority and the name in the
//! fragment.

use crate::error::DecodeError;
use crate::subscription::decode_base64_text;
use crate::types::{NodeDescriptor, Protocol};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use tracing::debug;
use url::Url;

/// Port used when a URI descriptor omits one.
pub const DEFAULT_PORT: u16 = 443;

const URI_SCHEMES: &[(&str, Protocol)] = &[
    ("vless://", Protocol::Vless),
    ("trojan://", Protocol::Trojan),
    ("ss://", Protocol::Shadowsocks),
    ("hysteria2://", Protocol::Hysteria2),
    ("hy2://", Protocol::Hysteria2),
];

/// First match wins, so more specific regions go first.
const COUNTRY_KEYWORDS: &[(&str, &[&str])] = &[
    ("HK", &["hk", "hongkong", "hong kong", "香港"]),
    ("JP", &["jp", "japan", "tokyo", "osaka", "日本", "东京"]),
    ("KR", &["kr", "korea", "seoul", "韩国"]),
    ("SG", &["sg", "singapore", "新加坡"]),
    ("TW", &["tw", "taiwan", "台湾"]),
    ("US", &["us", "usa", "america", "united states", "美国"]),
];

/// Parse one descriptor. Never fails: anything malformed comes back as an
/// unusable descriptor (`Protocol::Unknown`, empty host).
pub fn parse(descriptor: &str) -> NodeDescriptor {
    match try_parse(descriptor) {
        Ok(node) => node,
        Err(e) => {
            debug!(descriptor = %truncate(descriptor, 48), error = %e, "unusable descriptor");
            NodeDescriptor::unusable(descriptor)
        }
    }
}

/// Parse a batch, keeping input order.
pub fn parse_all<I, S>(descriptors: I) -> Vec<NodeDescriptor>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    descriptors.into_iter().map(|d| parse(d.as_ref())).collect()
}

pub fn try_parse(descriptor: &str) -> Result<NodeDescriptor, DecodeError> {
    let descriptor = descriptor.trim();
    if let Some(payload) = descriptor.strip_prefix("vmess://") {
        return parse_vmess(descriptor, payload);
    }
    for (prefix, protocol) in URI_SCHEMES {
        if descriptor.starts_with(prefix) {
            return parse_uri(descriptor, *protocol);
        }
    }
    Err(DecodeError::UnknownScheme)
}

#[derive(Debug, Deserialize)]
struct VmessPayload {
    #[serde(default)]
    add: Option<String>,
    #[serde(default)]
    port: Option<PortField>,
    #[serde(default)]
    ps: Option<String>,
}

/// Exporters disagree on whether the port is a number or a string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortField {
    Number(i64),
    Text(String),
}

fn parse_vmess(raw: &str, payload: &str) -> Result<NodeDescriptor, DecodeError> {
    let text = decode_base64_text(payload)?;
    let record: VmessPayload = serde_json::from_str(&text)?;

    let host = record
        .add
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .ok_or(DecodeError::MissingField("add"))?;
    let port = match record.port {
        Some(PortField::Number(n)) => valid_port(&n.to_string())?,
        Some(PortField::Text(s)) => valid_port(s.trim())?,
        None => return Err(DecodeError::MissingField("port")),
    };
    let display_name = record
        .ps
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| host.clone());

    Ok(build(Protocol::Vmess, host, port, display_name, raw))
}

fn parse_uri(raw: &str, protocol: Protocol) -> Result<NodeDescriptor, DecodeError> {
    let url = match protocol {
        Protocol::Shadowsocks => shadowsocks_url(raw)?,
        _ => Url::parse(raw)?,
    };

    let host = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .filter(|h| !h.is_empty())
        .ok_or(DecodeError::MissingField("host"))?;
    let port = match url.port() {
        Some(0) => return Err(DecodeError::InvalidPort("0".into())),
        Some(p) => p,
        None => DEFAULT_PORT,
    };
    let display_name = url
        .fragment()
        .map(|f| percent_decode_str(f).decode_utf8_lossy().trim().to_string())
        .unwrap_or_default();

    Ok(build(protocol, host, port, display_name, raw))
}

/// Handles both `ss://userinfo@host:port` and the legacy
/// `ss://BASE64(method:password@host:port)#name` form.
fn shadowsocks_url(raw: &str) -> Result<Url, DecodeError> {
    let rest = &raw["ss://".len()..];
    let (body, fragment) = match rest.split_once('#') {
        Some((b, f)) => (b, Some(f)),
        None => (rest, None),
    };
    let encoded = body.split('?').next().unwrap_or("");
    if encoded.contains('@') {
        return Ok(Url::parse(raw)?);
    }

    let decoded = decode_base64_text(encoded.trim_end_matches('/'))?;
    let mut rebuilt = format!("ss://{}", decoded.trim());
    if let Some(f) = fragment {
        rebuilt.push('#');
        rebuilt.push_str(f);
    }
    Ok(Url::parse(&rebuilt)?)
}

fn valid_port(s: &str) -> Result<u16, DecodeError> {
    match s.parse::<u32>() {
        Ok(p) if (1..=65535).contains(&p) => Ok(p as u16),
        _ => Err(DecodeError::InvalidPort(s.to_string())),
    }
}

fn build(protocol: Protocol, host: String, port: u16, display_name: String, raw: &str) -> NodeDescriptor {
    let country_tag = infer_country(&display_name);
    NodeDescriptor {
        protocol,
        host,
        port: Some(port),
        display_name,
        country_tag,
        raw_descriptor: raw.to_string(),
    }
}

/// Best-effort region code from a display name.
///
/// Single-word ASCII keywords must appear as a standalone token (`HK-01`,
/// `[JP]`, `hk02`) so that `Russia` does not read as `US`. Multi-word and
/// CJK keywords match anywhere. Matching is case-insensitive.
pub fn infer_country(name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    let lower = name.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.trim_end_matches(|c: char| c.is_ascii_digit()))
        .collect();

    for (code, keywords) in COUNTRY_KEYWORDS {
        let hit = keywords.iter().any(|kw| {
            if kw.is_ascii() && !kw.contains(' ') {
                tokens.iter().any(|t| t == kw)
            } else {
                lower.contains(kw)
            }
        });
        if hit {
            return Some((*code).to_string());
        }
    }
    None
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
