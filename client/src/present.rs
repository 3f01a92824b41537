//! Form presentation
//!
//! The parsed [`AuthForm`] stays with the session. The handler only ever
//! sees a [`PresentedForm`]: a fresh projection with the fields the active
//! auth group hides already filtered out. Values the handler writes are
//! copied back into the parsed form by position once it returns.

use crate::error::{BoxError, SessionError};
use async_trait::async_trait;
use tollgate_protocol::{AUTHGROUP_FIELD, AuthForm, Choice, FormOptKind};
use tracing::{debug, error};

/// Field pre-filled from the auth group's choice
const SECONDARY_USERNAME: &str = "secondary_username";

/// Result of presenting a form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormOutcome {
    Ok,
    Cancelled,
    /// The user picked a different auth group
    NewGroup,
}

/// A field as shown to the form handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentedOpt {
    kind: FormOptKind,
    name: String,
    label: Option<String>,
    value: Option<String>,
    source: usize,
}

impl PresentedOpt {
    pub fn kind(&self) -> &FormOptKind {
        &self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = Some(value.into());
    }

    pub fn clear_value(&mut self) {
        self.value = None;
    }

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

/// What the form handler gets to see and fill in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentedForm {
    pub banner: Option<String>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub auth_id: Option<String>,
    opts: Vec<PresentedOpt>,
    authgroup: Option<usize>,
    authgroup_selection: usize,
}

impl PresentedForm {
    pub fn opts(&self) -> &[PresentedOpt] {
        &self.opts
    }

    pub fn opts_mut(&mut self) -> &mut [PresentedOpt] {
        &mut self.opts
    }

    pub fn opt_mut(&mut self, name: &str) -> Option<&mut PresentedOpt> {
        self.opts.iter_mut().find(|o| o.name == name)
    }

    /// The auth group selector, when the form has one
    pub fn authgroup_opt(&self) -> Option<&PresentedOpt> {
        self.authgroup.and_then(|i| self.opts.get(i))
    }

    pub fn authgroup_opt_mut(&mut self) -> Option<&mut PresentedOpt> {
        self.authgroup.and_then(|i| self.opts.get_mut(i))
    }

    /// Index of the auth group choice that is currently in effect
    pub fn authgroup_selection(&self) -> usize {
        self.authgroup_selection
    }
}

/// Presents forms to the user
#[async_trait]
pub trait FormHandler: Send {
    async fn process_form(&mut self, form: &mut PresentedForm) -> Result<FormOutcome, BoxError>;
}

/// Present `form` through `handler` and copy the answers back
///
/// In legacy (non-structured) mode the auth group is not echoed by the
/// server, so `authgroup` picks the active choice, and a group change
/// re-presents the form immediately. In structured mode a group change is
/// returned to the caller, which must restart the exchange.
pub async fn process_auth_form(
    form: &mut AuthForm,
    handler: Option<&mut (dyn FormHandler + '_)>,
    xmlpost: bool,
    authgroup: &mut Option<String>,
) -> Result<FormOutcome, SessionError> {
    let Some(handler) = handler else {
        error!("No form handler; cannot authenticate.");
        return Err(SessionError::NoFormHandler);
    };

    loop {
        let mut presented = project(form, xmlpost, authgroup.as_deref());
        let outcome = handler.process_form(&mut presented).await.map_err(|e| {
            error!("Form handler failed: {}", e);
            SessionError::Handler(e)
        })?;

        for opt in presented.opts {
            if let Some(target) = form.opts.get_mut(opt.source) {
                target.value = opt.value;
            }
        }

        if outcome == FormOutcome::NewGroup {
            if let Some(group) = form.authgroup_opt().and_then(|o| o.value.clone()) {
                debug!("Auth group changed to '{}'", group);
                *authgroup = Some(group);
                if !xmlpost {
                    continue;
                }
            }
        }

        return Ok(outcome);
    }
}

/// Build the visible form for the currently active auth group
fn project(form: &mut AuthForm, xmlpost: bool, authgroup: Option<&str>) -> PresentedForm {
    let mut choice: Option<Choice> = None;
    let group_choices = form
        .authgroup_opt()
        .map(|o| o.choices().to_vec())
        .unwrap_or_default();

    if !group_choices.is_empty() && !xmlpost {
        if let Some(remembered) = authgroup {
            if let Some(i) = group_choices.iter().position(|c| c.name == remembered) {
                form.authgroup_selection = i;
            }
        }
        choice = group_choices.get(form.authgroup_selection).cloned();
    }

    let mut opts = Vec::with_capacity(form.opts.len());
    let mut authgroup_index = None;
    for (source, opt) in form.opts.iter_mut().enumerate() {
        if opt.is_select() {
            if opt.choices().is_empty() {
                continue;
            }
            if opt.name == AUTHGROUP_FIELD {
                authgroup_index = Some(opts.len());
            }
        } else if let Some(choice) = &choice {
            let is_input = matches!(opt.kind, FormOptKind::Text | FormOptKind::Password);
            if choice.noaaa && is_input {
                continue;
            }
            if !choice.second_auth && opt.second_auth {
                continue;
            }
            if opt.name == SECONDARY_USERNAME && opt.second_auth {
                if let Some(username) = &choice.secondary_username {
                    opt.value = Some(username.clone());
                }
                if !choice.secondary_username_editable {
                    continue;
                }
            }
        }

        opts.push(PresentedOpt {
            kind: opt.kind.clone(),
            name: opt.name.clone(),
            label: opt.label.clone(),
            value: opt.value.clone(),
            source,
        });
    }

    PresentedForm {
        banner: form.banner.clone(),
        message: form.message.clone(),
        error: form.error.clone(),
        auth_id: form.auth_id.clone(),
        opts,
        authgroup: authgroup_index,
        authgroup_selection: form.authgroup_selection,
    }
}
