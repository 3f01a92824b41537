//! Gateway auth response parsing
//!
//! Two response shapes are accepted. The legacy one has `<auth>` as its
//! root; the structured one wraps `<auth>` in `<config-auth>` alongside
//! `<opaque>`, `<session-token>` and `<host-scan>` siblings.

use crate::form::{AUTHGROUP_FIELD, AuthForm, Choice, FormOpt, FormOptKind};
use crate::xml::{Element, XmlError};
use thiserror::Error;
use tracing::{debug, error, info, trace};

/// Response parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Empty response from server")]
    Empty,

    #[error("Failed to parse server response: {0}")]
    Xml(#[from] XmlError),

    #[error("Received <client-cert-request> when not expected")]
    UnexpectedCertRequest,

    #[error("Cannot handle form method='{method}', action='{action}'")]
    UnsupportedForm { method: String, action: String },

    #[error("Form choice has no name")]
    UnnamedSelect,

    #[error("XML response has no \"auth\" node")]
    NoAuthNode,
}

/// Decides whether a password field can be answered by a token generator
///
/// Called once per password input while the form is being built, so the
/// decision is re-evaluated for every response.
pub trait TokenPolicy {
    fn can_generate(&mut self, form: &AuthForm, field: &str) -> bool;
}

/// Element name carrying host-checker URLs for this platform
pub fn default_csd_tag() -> &'static str {
    if cfg!(target_os = "macos") {
        "csdMac"
    } else {
        "csdLinux"
    }
}

/// State the parser needs from the surrounding session
pub struct ParseContext<'a> {
    /// A `<client-cert-request>` is acceptable in this response
    pub cert_request_allowed: bool,

    /// Host checker already ran; its elements are ignored
    pub csd_done: bool,

    /// Skip stub URLs (platforms that cannot run the stub)
    pub csd_nostub: bool,

    pub csd_tag: &'a str,
    pub token: Option<&'a mut dyn TokenPolicy>,
}

impl Default for ParseContext<'_> {
    fn default() -> Self {
        Self {
            cert_request_allowed: false,
            csd_done: false,
            csd_nostub: false,
            csd_tag: default_csd_tag(),
            token: None,
        }
    }
}

/// Host-checker data found in a response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsdUpdate {
    pub token: Option<String>,
    pub ticket: Option<String>,
    pub stuburl: Option<String>,
    pub starturl: Option<String>,
    pub waiturl: Option<String>,

    /// The platform element was present (legacy shape)
    pub platform_seen: bool,
}

impl CsdUpdate {
    pub fn is_empty(&self) -> bool {
        *self == CsdUpdate::default()
    }
}

/// Everything extracted from one gateway response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthResponse {
    pub form: AuthForm,
    pub cert_requested: bool,
    pub session_token: Option<String>,
    pub opaque: Option<Element>,
    pub csd: CsdUpdate,
}

/// Parse a gateway response body
pub fn parse_auth_response(
    body: &str,
    ctx: &mut ParseContext<'_>,
) -> Result<AuthResponse, ParseError> {
    if body.trim().is_empty() {
        trace!("Empty response from server");
        return Err(ParseError::Empty);
    }

    let root = Element::parse(body).map_err(|e| {
        error!("Failed to parse server response");
        trace!("Response was:{}", body);
        ParseError::from(e)
    })?;

    let mut resp = AuthResponse::default();
    let top: Vec<&Element> = if root.is_named("config-auth") {
        root.elements().collect()
    } else {
        vec![&root]
    };

    for node in top {
        match node.name.as_str() {
            "client-cert-request" => {
                if !ctx.cert_request_allowed {
                    error!("Received <client-cert-request> when not expected.");
                    return Err(ParseError::UnexpectedCertRequest);
                }
                resp.cert_requested = true;
            }
            "auth" => {
                if let Some(id) = node.attr("id") {
                    resp.form.auth_id = Some(id.to_string());
                }
                parse_auth_node(node, &mut resp.form, &mut resp.csd, ctx)?;
            }
            "opaque" => resp.opaque = Some(node.clone()),
            "host-scan" => {
                if !ctx.csd_done {
                    parse_host_scan(node, &mut resp.csd);
                }
            }
            _ => {
                set_text(node, "session-token", &mut resp.session_token);
                set_text(node, "error", &mut resp.form.error);
            }
        }
    }

    if resp.form.auth_id.is_none() && !resp.cert_requested {
        error!("XML response has no \"auth\" node");
        return Err(ParseError::NoAuthNode);
    }

    Ok(resp)
}

/// Element text with `%s` markers replaced by `param1`/`param2`
///
/// Substitution stops at the first marker other than `%s` and after two
/// markers; whatever is left is kept literally. Empty text yields `None`.
pub fn format_message(element: &Element) -> Option<String> {
    let fmt = element.text();
    if fmt.is_empty() {
        return None;
    }

    let params = [element.attr("param1"), element.attr("param2")];
    let mut out = String::with_capacity(fmt.len());
    let mut rest = fmt.as_str();
    let mut used = 0;

    while let Some(pos) = rest.find('%') {
        let after = &rest[pos + 1..];
        if !after.starts_with('s') {
            break;
        }
        out.push_str(&rest[..pos]);
        match params[used] {
            Some(param) => {
                out.push_str(param);
                rest = &after[1..];
            }
            None => {
                out.push('%');
                rest = after;
            }
        }
        used += 1;
        if used == params.len() {
            break;
        }
    }
    out.push_str(rest);
    Some(out)
}

fn set_text(element: &Element, name: &str, slot: &mut Option<String>) {
    if element.is_named(name) {
        if let Some(text) = format_message(element) {
            *slot = Some(text);
        }
    }
}

fn set_attr(element: &Element, key: &str, slot: &mut Option<String>) {
    if let Some(value) = element.attr(key) {
        *slot = Some(value.to_string());
    }
}

fn parse_auth_node(
    auth: &Element,
    form: &mut AuthForm,
    csd: &mut CsdUpdate,
    ctx: &mut ParseContext<'_>,
) -> Result<(), ParseError> {
    for node in auth.elements() {
        set_text(node, "banner", &mut form.banner);
        set_text(node, "message", &mut form.message);
        set_text(node, "error", &mut form.error);

        if node.is_named("form") {
            let method = node.attr("method").unwrap_or("POST").to_string();
            let action = node.attr("action").unwrap_or("/").to_string();

            if !method.eq_ignore_ascii_case("POST") || action.is_empty() {
                error!("Cannot handle form method='{}', action='{}'", method, action);
                return Err(ParseError::UnsupportedForm { method, action });
            }
            form.method = Some(method);
            form.action = Some(action);

            parse_form(node, form, ctx)?;
        } else if !ctx.csd_done && node.is_named("csd") {
            set_attr(node, "token", &mut csd.token);
            set_attr(node, "ticket", &mut csd.ticket);
        } else if !ctx.csd_done && node.is_named(ctx.csd_tag) {
            if !ctx.csd_nostub {
                set_attr(node, "stuburl", &mut csd.stuburl);
            }
            set_attr(node, "starturl", &mut csd.starturl);
            set_attr(node, "waiturl", &mut csd.waiturl);
            csd.platform_seen = true;
        }
    }
    Ok(())
}

fn parse_host_scan(node: &Element, csd: &mut CsdUpdate) {
    for child in node.elements() {
        set_text(child, "host-scan-ticket", &mut csd.ticket);
        set_text(child, "host-scan-token", &mut csd.token);
        set_text(child, "host-scan-base-uri", &mut csd.starturl);
        set_text(child, "host-scan-wait-uri", &mut csd.waiturl);
    }
}

fn parse_form(
    node: &Element,
    form: &mut AuthForm,
    ctx: &mut ParseContext<'_>,
) -> Result<(), ParseError> {
    for input in node.elements() {
        if input.is_named("select") {
            parse_select(input, form)?;
            continue;
        }
        if !input.is_named("input") {
            trace!("name {} not input", input.name);
            continue;
        }

        let Some(input_type) = input.attr("type") else {
            info!("No input type in form");
            continue;
        };
        if input_type == "submit" || input_type == "reset" {
            debug!(
                "Ignoring {} input '{}'",
                input_type,
                input.attr("name").unwrap_or_default()
            );
            continue;
        }
        let Some(name) = input.attr("name") else {
            info!("No input name in form");
            continue;
        };

        let kind = match input_type {
            "hidden" => FormOptKind::Hidden,
            "text" => FormOptKind::Text,
            "password" => {
                let promote = match ctx.token.as_mut() {
                    Some(policy) => policy.can_generate(form, name),
                    None => false,
                };
                if promote {
                    FormOptKind::Token
                } else {
                    FormOptKind::Password
                }
            }
            other => {
                info!("Unknown input type {} in form", other);
                continue;
            }
        };

        let mut opt = FormOpt::new(kind, name);
        opt.label = input.attr("label").map(str::to_string);
        opt.second_auth = input.attr_is("second-auth", "1");
        if opt.kind == FormOptKind::Hidden {
            opt.value = input.attr("value").map(str::to_string);
        }
        form.push_opt(opt);
    }
    Ok(())
}

fn parse_select(node: &Element, form: &mut AuthForm) -> Result<(), ParseError> {
    let Some(name) = node.attr("name") else {
        error!("Form choice has no name");
        return Err(ParseError::UnnamedSelect);
    };

    let mut choices = Vec::new();
    let mut selection = 0;
    for option in node.elements().filter(|e| e.is_named("option")) {
        let label = option.text();
        let choice = Choice {
            name: option
                .attr("value")
                .map(str::to_string)
                .unwrap_or_else(|| label.clone()),
            label,
            auth_type: option.attr("auth-type").map(str::to_string),
            override_name: option.attr("override-name").map(str::to_string),
            override_label: option.attr("override-label").map(str::to_string),
            second_auth: option.attr_is("second-auth", "1"),
            noaaa: option.attr_is("noaaa", "1"),
            secondary_username: option.attr("secondary_username").map(str::to_string),
            secondary_username_editable: option.attr_is("secondary_username_editable", "true"),
        };
        if option.attr_is("selected", "true") {
            selection = choices.len();
        }
        choices.push(choice);
    }

    if name == AUTHGROUP_FIELD {
        form.authgroup_selection = selection;
    }

    let mut opt = FormOpt::new(FormOptKind::Select(choices), name);
    opt.label = node.attr("label").map(str::to_string);
    form.push_opt(opt);
    Ok(())
}
