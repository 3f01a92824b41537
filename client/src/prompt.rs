//! Terminal form handler

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tollgate_client::{BoxError, FormHandler, FormOutcome, PresentedForm};
use tollgate_protocol::{AUTHGROUP_FIELD, FormOptKind};

/// Asks for each visible field on stderr and reads answers from stdin
pub struct TerminalHandler {
    lines: Lines<BufReader<Stdin>>,
    username: Option<String>,
}

impl TerminalHandler {
    /// `username` answers the first `username` field without asking
    pub fn new(username: Option<String>) -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
            username,
        }
    }

    /// Next line, or `None` at end of input
    async fn ask(&mut self, prompt: &str) -> Result<Option<String>, BoxError> {
        eprint!("{} ", prompt);
        Ok(self.lines.next_line().await?)
    }
}

#[async_trait]
impl FormHandler for TerminalHandler {
    async fn process_form(&mut self, form: &mut PresentedForm) -> Result<FormOutcome, BoxError> {
        for text in [&form.banner, &form.message].into_iter().flatten() {
            eprintln!("{}", text);
        }
        if let Some(err) = &form.error {
            eprintln!("Error: {}", err);
        }

        let group_before = form.authgroup_selection();
        let mut group_after = group_before;

        for i in 0..form.opts().len() {
            let opt = &mut form.opts_mut()[i];
            let label = opt.label().unwrap_or(opt.name()).to_string();

            match opt.kind().clone() {
                FormOptKind::Hidden | FormOptKind::Token => {}
                FormOptKind::Select(choices) => {
                    let is_group = opt.name() == AUTHGROUP_FIELD;
                    let default = if is_group { group_before } else { 0 };
                    for (n, choice) in choices.iter().enumerate() {
                        let mark = if n == default { '*' } else { ' ' };
                        eprintln!("{} [{}] {}", mark, n + 1, choice.label);
                    }
                    let Some(answer) = self.ask(&label).await? else {
                        return Ok(FormOutcome::Cancelled);
                    };
                    let answer = answer.trim();
                    let picked = if answer.is_empty() {
                        Some(default)
                    } else {
                        answer
                            .parse::<usize>()
                            .ok()
                            .and_then(|n| n.checked_sub(1))
                            .filter(|&n| n < choices.len())
                            .or_else(|| {
                                choices
                                    .iter()
                                    .position(|c| c.name == answer || c.label == answer)
                            })
                    };
                    let Some(picked) = picked else {
                        return Err(format!("Invalid choice '{}'", answer).into());
                    };
                    opt.set_value(choices[picked].name.clone());
                    if is_group {
                        group_after = picked;
                    }
                }
                FormOptKind::Text if opt.name() == "username" && self.username.is_some() => {
                    if let Some(user) = self.username.take() {
                        opt.set_value(user);
                    }
                }
                FormOptKind::Text | FormOptKind::Password => {
                    let Some(answer) = self.ask(&label).await? else {
                        return Ok(FormOutcome::Cancelled);
                    };
                    opt.set_value(answer);
                }
            }
        }

        if group_after != group_before {
            return Ok(FormOutcome::NewGroup);
        }
        Ok(FormOutcome::Ok)
    }
}
