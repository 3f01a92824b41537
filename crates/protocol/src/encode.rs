//! Request body encoding
//!
//! A completed form goes back to the gateway either as a URL-encoded
//! `name=value&...` list or as a `<config-auth type="auth-reply">` document.

use crate::form::{AUTHGROUP_FIELD, AuthForm};
use crate::xml::{Element, XmlError};
use thiserror::Error;

/// Default request body capacity
pub const DEFAULT_BODY_CAPACITY: usize = 2048;

/// Fields submitted under the name `password` in structured bodies
const PASSWORD_ALIASES: &[&str] = &["answer", "whichpin", "new_password"];

/// Fields never submitted in structured bodies
const DROPPED_FIELDS: &[&str] = &["verify_pin", "verify_password"];

/// Encoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Request body exceeds {capacity} bytes")]
    NoSpace { capacity: usize },

    #[error("Request body of {size} bytes too large for buffer ({capacity} bytes)")]
    TooLarge { size: usize, capacity: usize },

    #[error(transparent)]
    Xml(#[from] XmlError),
}

/// Body format for form submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEncoding {
    Legacy,
    Structured,
}

/// Mobile platform attributes of `<device-id>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MobileIdentity {
    pub platform_version: String,
    pub device_type: String,
    pub unique_id: String,
}

/// Client identity written into every structured body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub version: String,
    pub device_id: String,
    pub mobile: Option<MobileIdentity>,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            version: format!("v{}", env!("CARGO_PKG_VERSION")),
            device_id: default_device_id().to_string(),
            mobile: None,
        }
    }
}

/// Platform name reported as `<device-id>`
pub fn default_device_id() -> &'static str {
    if cfg!(target_os = "macos") {
        "mac-intel"
    } else if cfg!(target_os = "windows") {
        "win"
    } else {
        "linux-64"
    }
}

/// Session state echoed in a structured auth reply
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplyContext<'a> {
    pub opaque: Option<&'a Element>,
    pub csd_token: Option<&'a str>,
}

/// Parameters of the structured initial request
#[derive(Debug, Clone, Copy)]
pub struct InitRequest<'a> {
    pub host: &'a str,
    pub path: Option<&'a str>,
    pub cert_fail: bool,
    pub authgroup: Option<&'a str>,
}

/// Encode a form as `name=value&...`
///
/// Alphanumerics pass through, every other byte becomes `%XX`. The result
/// must be strictly shorter than `capacity`.
pub fn encode_legacy(form: &AuthForm, capacity: usize) -> Result<String, EncodeError> {
    let mut body = String::new();
    for opt in &form.opts {
        if !body.is_empty() {
            body.push('&');
        }
        percent_encode(&opt.name, &mut body);
        body.push('=');
        if let Some(value) = &opt.value {
            percent_encode(value, &mut body);
        }
        if body.len() >= capacity {
            return Err(EncodeError::NoSpace { capacity });
        }
    }
    Ok(body)
}

/// Encode a form as a `<config-auth type="auth-reply">` document
pub fn encode_structured(
    form: &AuthForm,
    identity: &ClientIdentity,
    reply: ReplyContext<'_>,
    capacity: usize,
) -> Result<String, EncodeError> {
    let mut root = new_query(identity, "auth-reply");
    if let Some(opaque) = reply.opaque {
        root.push_child(opaque.clone());
    }

    let mut auth = Element::new("auth");
    let mut trailing = Vec::new();
    for opt in &form.opts {
        let value = opt.value.as_deref().unwrap_or_default();
        if opt.name == AUTHGROUP_FIELD {
            trailing.push(text_element("group-select", value));
        } else if PASSWORD_ALIASES.contains(&opt.name.as_str()) {
            auth.push_child(text_element("password", value));
        } else if DROPPED_FIELDS.contains(&opt.name.as_str()) {
            continue;
        } else {
            auth.push_child(text_element(&opt.name, value));
        }
    }
    root.push_child(auth);
    for element in trailing {
        root.push_child(element);
    }
    if let Some(token) = reply.csd_token {
        root.push_child(text_element("host-scan-token", token));
    }

    complete(&root, capacity)
}

/// Encode the structured `<config-auth type="init">` request
pub fn encode_init_request(
    identity: &ClientIdentity,
    init: &InitRequest<'_>,
    capacity: usize,
) -> Result<String, EncodeError> {
    let mut root = new_query(identity, "init");

    let url = match init.path {
        Some(path) => format!("https://{}/{}", init.host, path),
        None => format!("https://{}", init.host),
    };
    root.push_child(text_element("group-access", &url));
    if init.cert_fail {
        root.push_child(Element::new("client-cert-fail"));
    }
    if let Some(group) = init.authgroup {
        root.push_child(text_element("group-select", group));
    }

    complete(&root, capacity)
}

fn new_query(identity: &ClientIdentity, kind: &str) -> Element {
    let mut device = text_element("device-id", &identity.device_id);
    if let Some(mobile) = &identity.mobile {
        device = device
            .with_attr("platform-version", mobile.platform_version.as_str())
            .with_attr("device-type", mobile.device_type.as_str())
            .with_attr("unique-id", mobile.unique_id.as_str());
    }

    Element::new("config-auth")
        .with_attr("client", "vpn")
        .with_attr("type", kind)
        .with_child(text_element("version", &identity.version).with_attr("who", "vpn"))
        .with_child(device)
}

fn text_element(name: &str, text: &str) -> Element {
    let element = Element::new(name);
    if text.is_empty() {
        element
    } else {
        element.with_text(text)
    }
}

fn complete(root: &Element, capacity: usize) -> Result<String, EncodeError> {
    let doc = root.to_document()?;
    if doc.len() > capacity {
        return Err(EncodeError::TooLarge {
            size: doc.len(),
            capacity,
        });
    }
    Ok(doc)
}

fn percent_encode(input: &str, out: &mut String) {
    for b in input.bytes() {
        if b.is_ascii_alphanumeric() {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::{Choice, FormOpt, FormOptKind};

    fn percent_decode(input: &str) -> String {
        let bytes = input.as_bytes();
        let mut out = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'%' {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap();
                out.push(u8::from_str_radix(hex, 16).unwrap());
                i += 3;
            } else {
                out.push(bytes[i]);
                i += 1;
            }
        }
        String::from_utf8(out).unwrap()
    }

    fn decode_legacy(body: &str) -> Vec<(String, String)> {
        body.split('&')
            .map(|pair| {
                let (k, v) = pair.split_once('=').unwrap();
                (percent_decode(k), percent_decode(v))
            })
            .collect()
    }

    fn sample_form() -> AuthForm {
        let mut form = AuthForm::default();
        form.push_opt(FormOpt::new(FormOptKind::Text, "username").with_value("alice@corp"));
        form.push_opt(FormOpt::new(FormOptKind::Password, "password").with_value("p&ss w=rd"));
        form.push_opt(FormOpt::new(FormOptKind::Password, "answer").with_value("42"));
        form.push_opt(FormOpt::new(FormOptKind::Password, "verify_pin").with_value("1234"));
        form.push_opt(FormOpt::new(FormOptKind::Hidden, "tgroup"));
        let choices = vec![Choice {
            name: "eng".into(),
            label: "Engineering".into(),
            ..Default::default()
        }];
        form.push_opt(FormOpt::new(FormOptKind::Select(choices), AUTHGROUP_FIELD).with_value("eng"));
        form
    }

    #[test]
    fn test_legacy_body() {
        let body = encode_legacy(&sample_form(), DEFAULT_BODY_CAPACITY).unwrap();
        assert!(body.starts_with("group%5Flist=eng&username=alice%40corp&"));
        assert!(body.contains("password=p%26ss%20w%3Drd"));
        assert!(body.ends_with("&tgroup="));

        let pairs = decode_legacy(&body);
        assert_eq!(pairs.len(), 6);
        assert!(pairs.contains(&("password".into(), "p&ss w=rd".into())));
        assert!(pairs.contains(&("verify_pin".into(), "1234".into())));
    }

    #[test]
    fn test_legacy_body_too_big() {
        let mut form = AuthForm::default();
        form.push_opt(FormOpt::new(FormOptKind::Text, "username").with_value("x".repeat(64)));

        assert_eq!(
            encode_legacy(&form, 64),
            Err(EncodeError::NoSpace { capacity: 64 })
        );
        // "username=" plus 64 bytes fits in 74
        assert!(encode_legacy(&form, 74).is_ok());
        assert!(encode_legacy(&form, 73).is_err());
    }

    #[test]
    fn test_structured_body() {
        let opaque = Element::new("opaque")
            .with_attr("is-for", "sg")
            .with_child(Element::new("tunnel-group").with_text("corp"));
        let identity = ClientIdentity {
            version: "v9.12".into(),
            device_id: "linux-64".into(),
            mobile: None,
        };
        let reply = ReplyContext {
            opaque: Some(&opaque),
            csd_token: Some("SCAN"),
        };
        let body = encode_structured(&sample_form(), &identity, reply, 4096).unwrap();

        let root = Element::parse(&body).unwrap();
        assert_eq!(root.attr("type"), Some("auth-reply"));
        let order: Vec<_> = root.elements().map(|e| e.name.as_str()).collect();
        assert_eq!(
            order,
            ["version", "device-id", "opaque", "auth", "group-select", "host-scan-token"]
        );

        let echoed = root.elements().find(|e| e.is_named("opaque")).unwrap();
        assert_eq!(echoed, &opaque);

        let auth = root.elements().find(|e| e.is_named("auth")).unwrap();
        let fields: Vec<_> = auth.elements().map(|e| (e.name.as_str(), e.text())).collect();
        assert_eq!(
            fields,
            [
                ("username", "alice@corp".to_string()),
                ("password", "p&ss w=rd".to_string()),
                ("password", "42".to_string()),
                ("tgroup", String::new()),
            ]
        );
        let group = root.elements().find(|e| e.is_named("group-select")).unwrap();
        assert_eq!(group.text(), "eng");
    }

    #[test]
    fn test_structured_too_large() {
        let err = encode_structured(
            &sample_form(),
            &ClientIdentity::default(),
            ReplyContext::default(),
            100,
        )
        .unwrap_err();
        assert!(matches!(err, EncodeError::TooLarge { capacity: 100, .. }));
    }

    #[test]
    fn test_init_request() {
        let identity = ClientIdentity {
            mobile: Some(MobileIdentity {
                platform_version: "14".into(),
                device_type: "Pixel".into(),
                unique_id: "abc".into(),
            }),
            ..Default::default()
        };
        let init = InitRequest {
            host: "vpn.example.com",
            path: Some("corp"),
            cert_fail: true,
            authgroup: Some("eng"),
        };
        let body = encode_init_request(&identity, &init, DEFAULT_BODY_CAPACITY).unwrap();
        let root = Element::parse(&body).unwrap();

        assert_eq!(root.attr("type"), Some("init"));
        let access = root.elements().find(|e| e.is_named("group-access")).unwrap();
        assert_eq!(access.text(), "https://vpn.example.com/corp");
        assert!(root.elements().any(|e| e.is_named("client-cert-fail")));
        let device = root.elements().find(|e| e.is_named("device-id")).unwrap();
        assert_eq!(device.attr("device-type"), Some("Pixel"));

        let init = InitRequest {
            host: "vpn.example.com",
            path: None,
            cert_fail: false,
            authgroup: None,
        };
        let body = encode_init_request(&ClientIdentity::default(), &init, DEFAULT_BODY_CAPACITY).unwrap();
        assert!(body.contains("<group-access>https://vpn.example.com</group-access>"));
        assert!(!body.contains("group-select"));
    }
}
