//! Auth form model

/// Name of the select field that carries the gateway's auth groups
pub const AUTHGROUP_FIELD: &str = "group_list";

/// One selectable entry of a `Select` field
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Choice {
    /// Value submitted when the entry is chosen
    pub name: String,

    /// Text shown to the user
    pub label: String,

    pub auth_type: Option<String>,
    pub override_name: Option<String>,
    pub override_label: Option<String>,

    /// Entry enables the second-factor fields of the form
    pub second_auth: bool,

    /// Entry hides the ordinary credential fields
    pub noaaa: bool,

    /// Pre-filled value for the `secondary_username` field
    pub secondary_username: Option<String>,
    pub secondary_username_editable: bool,
}

/// Field variants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormOptKind {
    Text,
    Password,
    Hidden,
    /// Password field filled in by the token generator
    Token,
    Select(Vec<Choice>),
}

impl FormOptKind {
    /// Short tag used in log lines
    pub fn as_str(&self) -> &'static str {
        match self {
            FormOptKind::Text => "text",
            FormOptKind::Password => "password",
            FormOptKind::Hidden => "hidden",
            FormOptKind::Token => "token",
            FormOptKind::Select(_) => "select",
        }
    }
}

/// A single field of an auth form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormOpt {
    pub kind: FormOptKind,
    pub name: String,
    pub label: Option<String>,
    pub value: Option<String>,

    /// Field only applies when the active choice has `second_auth`
    pub second_auth: bool,
}

impl FormOpt {
    pub fn new(kind: FormOptKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            label: None,
            value: None,
            second_auth: false,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Choices of a select field, empty for every other kind
    pub fn choices(&self) -> &[Choice] {
        match &self.kind {
            FormOptKind::Select(choices) => choices,
            _ => &[],
        }
    }

    pub fn is_select(&self) -> bool {
        matches!(self.kind, FormOptKind::Select(_))
    }
}

/// A gateway login form
///
/// Every select field sits ahead of the other fields, in reverse order of
/// appearance, so the auth-group select (when present) is always first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthForm {
    pub banner: Option<String>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub auth_id: Option<String>,
    pub method: Option<String>,
    pub action: Option<String>,
    pub opts: Vec<FormOpt>,

    /// Index into the auth-group select's choices of the active entry
    pub authgroup_selection: usize,
}

impl AuthForm {
    /// Add a field, keeping selects at the front
    pub fn push_opt(&mut self, opt: FormOpt) {
        if opt.is_select() {
            self.opts.insert(0, opt);
        } else {
            self.opts.push(opt);
        }
    }

    /// The auth-group select, if the form has one
    pub fn authgroup_opt(&self) -> Option<&FormOpt> {
        self.opts
            .iter()
            .find(|o| o.is_select() && o.name == AUTHGROUP_FIELD)
    }

    pub fn authgroup_opt_mut(&mut self) -> Option<&mut FormOpt> {
        self.opts
            .iter_mut()
            .find(|o| o.is_select() && o.name == AUTHGROUP_FIELD)
    }

    /// Choice currently selected in the auth-group select
    pub fn active_choice(&self) -> Option<&Choice> {
        self.authgroup_opt()
            .and_then(|o| o.choices().get(self.authgroup_selection))
    }

    pub fn opt(&self, name: &str) -> Option<&FormOpt> {
        self.opts.iter().find(|o| o.name == name)
    }

    pub fn opt_mut(&mut self, name: &str) -> Option<&mut FormOpt> {
        self.opts.iter_mut().find(|o| o.name == name)
    }

    /// The gateway reported a completed login
    pub fn is_success(&self) -> bool {
        self.auth_id.as_deref() == Some("success")
    }
}
