//! Soft token unlock
//!
//! A hardware-seed backend usually needs a device ID, password or PIN
//! before it can produce codes. Those are collected through the normal
//! form handler before the first request goes out.

use crate::error::SessionError;
use crate::present::{FormHandler, FormOutcome, process_auth_form};
use tollgate_crypto::{SeedError, TokenGenerator};
use tollgate_protocol::{AuthForm, FormOpt, FormOptKind};
use tracing::{debug, error, info};

/// How the unlock form ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockOutcome {
    Unlocked,
    /// The user submitted nothing; codes are not generated this session
    Bypassed,
    /// The user dismissed the form
    Cancelled,
}

/// Positions of each credential in the unlock form
#[derive(Default)]
struct Slots {
    devid: Option<usize>,
    pass: Option<usize>,
    pin: Option<usize>,
}

/// Ask for the seed credentials and unlock the engine
///
/// A backend without a seed engine has nothing to unlock.
pub async fn unlock_soft_token(
    tokens: &mut TokenGenerator,
    mut handler: Option<&mut (dyn FormHandler + '_)>,
) -> Result<UnlockOutcome, SessionError> {
    tokens.reset();

    let Some(engine) = tokens.seed_engine_mut() else {
        return Ok(UnlockOutcome::Unlocked);
    };

    let mut form = AuthForm {
        message: Some("Enter credentials to unlock software token.".to_string()),
        ..Default::default()
    };
    let mut slots = Slots::default();
    if engine.devid_required() {
        slots.devid = Some(form.opts.len());
        form.push_opt(FormOpt::new(FormOptKind::Text, "devid").with_label("Device ID:"));
    }
    if engine.pass_required() {
        slots.pass = Some(form.opts.len());
        form.push_opt(FormOpt::new(FormOptKind::Password, "password").with_label("Password:"));
    }
    if engine.pin_required() {
        slots.pin = Some(form.opts.len());
        form.push_opt(FormOpt::new(FormOptKind::Password, "password").with_label("PIN:"));
    }

    loop {
        for opt in form.opts.iter_mut() {
            opt.value = None;
        }

        if !form.opts.is_empty() {
            let mut no_group = None;
            let outcome =
                process_auth_form(&mut form, handler.as_deref_mut(), false, &mut no_group).await?;
            if outcome != FormOutcome::Ok {
                return Ok(UnlockOutcome::Cancelled);
            }

            let filled = form
                .opts
                .iter()
                .filter(|o| o.value.as_deref().is_some_and(|v| !v.is_empty()))
                .count();
            if filled == 0 {
                info!("User bypassed soft token.");
                tokens.bypass();
                return Ok(UnlockOutcome::Bypassed);
            }
            if filled < form.opts.len() {
                info!("All fields are required; try again.");
                continue;
            }
        }

        let value = |slot: Option<usize>| {
            slot.and_then(|i| form.opts.get(i))
                .and_then(|o| o.value.clone())
        };
        let devid = value(slots.devid);
        let pass = value(slots.pass);
        let pin = value(slots.pin);

        let Some(engine) = tokens.seed_engine_mut() else {
            return Ok(UnlockOutcome::Unlocked);
        };
        match engine.decrypt_seed(pass.as_deref(), devid.as_deref()) {
            Ok(()) => {}
            Err(SeedError::Io(e)) => {
                error!("General failure in token engine: {}", e);
                return Err(SessionError::Token(SeedError::Io(e).into()));
            }
            Err(e) if devid.is_none() && pass.is_none() => {
                error!("General failure in token engine: {}", e);
                return Err(SessionError::Token(e.into()));
            }
            Err(_) => {
                info!("Incorrect device ID or password; try again.");
                continue;
            }
        }

        if let Some(pin) = pin {
            if engine.check_pin(&pin).is_err() {
                info!("Invalid PIN format; try again.");
                continue;
            }
            tokens.set_pin(Some(pin));
        }

        debug!("Soft token init was successful.");
        return Ok(UnlockOutcome::Unlocked);
    }
}
