//! Token code generator
//!
//! Fills password fields with one-time codes. The first attempt of a
//! session uses the current time; one follow-up attempt is allowed one
//! time step later when the gateway asks for the "next tokencode". After
//! that the user is left to type codes by hand so a rejected seed cannot
//! lock the account.

use crate::seed::{SEED_TIME_STEP, SeedEngine, SeedError};
use crate::totp::{Totp, TotpError};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tollgate_protocol::{AuthForm, FormOptKind, TokenPolicy};
use tracing::{debug, error, info};

/// Message text a gateway uses to ask for the following code
pub const NEXT_CODE_HINT: &str = "next tokencode";

/// Fields a hardware-seed engine answers for
const SEED_FIELDS: &[&str] = &["password", "answer"];

/// Field a TOTP generator answers for
const TOTP_FIELD: &str = "secondary_password";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Unable to generate OATH TOTP token code: {0}")]
    Totp(#[from] TotpError),

    #[error(transparent)]
    Seed(#[from] SeedError),
}

/// Where codes come from
pub enum TokenBackend {
    None,
    HardwareSeed(Box<dyn SeedEngine>),
    Totp(Totp),
}

impl std::fmt::Debug for TokenBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenBackend::None => f.write_str("None"),
            TokenBackend::HardwareSeed(_) => f.write_str("HardwareSeed"),
            TokenBackend::Totp(totp) => f.debug_tuple("Totp").field(totp).finish(),
        }
    }
}

/// Backend variant without its state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenMode {
    None,
    HardwareSeed,
    Totp,
}

/// Answer to "can a code be generated for this field now"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// First attempt, reference time is now
    Initial,
    /// Second attempt, reference time advanced one step
    Next,
    /// Retries exhausted; the user types the code
    ManualEntry,
    /// Backend inactive, bypassed, or not responsible for the field
    NotApplicable,
}

impl Eligibility {
    pub fn is_eligible(self) -> bool {
        matches!(self, Eligibility::Initial | Eligibility::Next)
    }
}

/// Retry-bounded token code generator
#[derive(Debug)]
pub struct TokenGenerator {
    backend: TokenBackend,
    tries: u32,
    token_time: Option<u64>,
    bypassed: bool,
    pin: Option<String>,
}

impl Default for TokenGenerator {
    fn default() -> Self {
        Self::new(TokenBackend::None)
    }
}

impl TokenGenerator {
    pub fn new(backend: TokenBackend) -> Self {
        Self {
            backend,
            tries: 0,
            token_time: None,
            bypassed: false,
            pin: None,
        }
    }

    pub fn mode(&self) -> TokenMode {
        match self.backend {
            TokenBackend::None => TokenMode::None,
            TokenBackend::HardwareSeed(_) => TokenMode::HardwareSeed,
            TokenBackend::Totp(_) => TokenMode::Totp,
        }
    }

    pub fn is_active(&self) -> bool {
        self.mode() != TokenMode::None
    }

    /// Codes generated so far this session
    pub fn tries(&self) -> u32 {
        self.tries
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypassed
    }

    /// Stop generating codes for the rest of the session
    pub fn bypass(&mut self) {
        self.bypassed = true;
    }

    /// Start a new session's attempt count
    pub fn reset(&mut self) {
        self.tries = 0;
        self.token_time = None;
        self.bypassed = false;
    }

    /// Drop the backend entirely
    pub fn disable(&mut self) {
        self.backend = TokenBackend::None;
    }

    pub fn set_pin(&mut self, pin: Option<String>) {
        self.pin = pin;
    }

    pub fn seed_engine_mut(&mut self) -> Option<&mut dyn SeedEngine> {
        match &mut self.backend {
            TokenBackend::HardwareSeed(engine) => Some(engine.as_mut()),
            _ => None,
        }
    }

    fn step(&self) -> u64 {
        match &self.backend {
            TokenBackend::Totp(totp) => totp.step(),
            _ => SEED_TIME_STEP,
        }
    }

    fn answers_for(&self, field: &str) -> bool {
        match self.backend {
            TokenBackend::None => false,
            TokenBackend::HardwareSeed(_) => SEED_FIELDS.contains(&field),
            TokenBackend::Totp(_) => field == TOTP_FIELD,
        }
    }

    /// Decide whether `field` can be filled, given the form's message
    ///
    /// An eligible answer also fixes the reference time of the next code.
    pub fn eligibility(&mut self, field: &str, message: Option<&str>) -> Eligibility {
        if self.bypassed || !self.answers_for(field) {
            return Eligibility::NotApplicable;
        }

        match self.tries {
            0 => {
                debug!("OK to generate INITIAL tokencode");
                self.token_time = None;
                Eligibility::Initial
            }
            1 if message.is_some_and(has_next_code_hint) => {
                debug!("OK to generate NEXT tokencode");
                let step = self.step();
                self.token_time = self.token_time.map(|t| t + step);
                Eligibility::Next
            }
            _ => {
                info!("Server is rejecting the soft token; switching to manual entry");
                Eligibility::ManualEntry
            }
        }
    }

    /// Fill the form's token field using the current time
    pub fn generate(&mut self, form: &mut AuthForm) -> Result<(), TokenError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.generate_at(form, now)
    }

    /// Fill the form's first token field; `now` is used when no reference
    /// time has been fixed yet
    pub fn generate_at(&mut self, form: &mut AuthForm, now: u64) -> Result<(), TokenError> {
        let Some(opt) = form
            .opts
            .iter_mut()
            .find(|o| o.kind == FormOptKind::Token)
        else {
            return Ok(());
        };

        let time = *self.token_time.get_or_insert(now);
        let code = match &self.backend {
            TokenBackend::None => return Ok(()),
            TokenBackend::HardwareSeed(engine) => {
                info!("Generating RSA token code");
                engine
                    .compute_tokencode(time, self.pin.as_deref())
                    .inspect_err(|e| error!("{}", e))?
            }
            TokenBackend::Totp(totp) => {
                info!("Generating OATH TOTP token code");
                totp.code_at(time).inspect_err(|e| error!("{}", e))?
            }
        };

        self.tries += 1;
        opt.value = Some(code);
        Ok(())
    }
}

impl TokenPolicy for TokenGenerator {
    fn can_generate(&mut self, form: &AuthForm, field: &str) -> bool {
        self.eligibility(field, form.message.as_deref()).is_eligible()
    }
}

fn has_next_code_hint(message: &str) -> bool {
    message.to_ascii_lowercase().contains(NEXT_CODE_HINT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_protocol::FormOpt;

    struct FixedEngine;

    impl SeedEngine for FixedEngine {
        fn devid_required(&self) -> bool {
            false
        }
        fn pass_required(&self) -> bool {
            false
        }
        fn pin_required(&self) -> bool {
            true
        }
        fn decrypt_seed(&mut self, _: Option<&str>, _: Option<&str>) -> Result<(), SeedError> {
            Ok(())
        }
        fn check_pin(&self, _: &str) -> Result<(), SeedError> {
            Ok(())
        }
        fn compute_tokencode(&self, t: u64, pin: Option<&str>) -> Result<String, SeedError> {
            Ok(format!("{}-{}", pin.unwrap_or("none"), t))
        }
    }

    fn totp_generator() -> TokenGenerator {
        TokenGenerator::new(TokenBackend::Totp(
            Totp::from_secret_str("12345678901234567890").unwrap(),
        ))
    }

    fn token_form(field: &str) -> AuthForm {
        let mut form = AuthForm::default();
        form.push_opt(FormOpt::new(FormOptKind::Text, "username"));
        form.push_opt(FormOpt::new(FormOptKind::Token, field));
        form
    }

    #[test]
    fn test_field_names_per_backend() {
        let mut totp = totp_generator();
        assert_eq!(totp.eligibility("password", None), Eligibility::NotApplicable);
        assert_eq!(totp.eligibility(TOTP_FIELD, None), Eligibility::Initial);

        let mut seed = TokenGenerator::new(TokenBackend::HardwareSeed(Box::new(FixedEngine)));
        assert_eq!(seed.eligibility("answer", None), Eligibility::Initial);
        assert_eq!(seed.eligibility("password", None), Eligibility::Initial);
        assert_eq!(seed.eligibility(TOTP_FIELD, None), Eligibility::NotApplicable);

        let mut none = TokenGenerator::default();
        assert_eq!(none.eligibility("password", None), Eligibility::NotApplicable);
        assert!(!none.is_active());
    }

    #[test]
    fn test_initial_then_next_then_manual() {
        let mut generator = totp_generator();
        let mut form = token_form(TOTP_FIELD);

        assert!(generator.eligibility(TOTP_FIELD, None).is_eligible());
        generator.generate_at(&mut form, 59).unwrap();
        assert_eq!(form.opt(TOTP_FIELD).unwrap().value.as_deref(), Some("287082"));
        assert_eq!(generator.tries(), 1);

        // Second attempt without the hint goes to manual entry
        assert_eq!(generator.eligibility(TOTP_FIELD, Some("Try again")), Eligibility::ManualEntry);

        let hint = Some("Wait for the token to change, then enter the NEXT TOKENCODE");
        assert_eq!(generator.eligibility(TOTP_FIELD, hint), Eligibility::Next);
        let mut form = token_form(TOTP_FIELD);
        generator.generate_at(&mut form, 1_000_000).unwrap();
        // Reference time is 59 + 30, not the wall clock
        let expected = Totp::from_secret_str("12345678901234567890")
            .unwrap()
            .code_at(89)
            .unwrap();
        assert_eq!(form.opt(TOTP_FIELD).unwrap().value.as_deref(), Some(expected.as_str()));

        assert_eq!(generator.eligibility(TOTP_FIELD, hint), Eligibility::ManualEntry);
    }

    #[test]
    fn test_seed_step_and_pin() {
        let mut generator = TokenGenerator::new(TokenBackend::HardwareSeed(Box::new(FixedEngine)));
        generator.set_pin(Some("1234".into()));

        assert!(generator.eligibility("password", None).is_eligible());
        let mut form = token_form("password");
        generator.generate_at(&mut form, 1000).unwrap();
        assert_eq!(form.opt("password").unwrap().value.as_deref(), Some("1234-1000"));

        assert!(generator.eligibility("password", Some("next tokencode")).is_eligible());
        let mut form = token_form("password");
        generator.generate_at(&mut form, 5000).unwrap();
        assert_eq!(form.opt("password").unwrap().value.as_deref(), Some("1234-1060"));
    }

    #[test]
    fn test_bypass_is_sticky() {
        let mut generator = totp_generator();
        generator.bypass();
        assert_eq!(generator.eligibility(TOTP_FIELD, None), Eligibility::NotApplicable);

        generator.reset();
        assert_eq!(generator.eligibility(TOTP_FIELD, None), Eligibility::Initial);
    }

    #[test]
    fn test_form_without_token_field_untouched() {
        let mut generator = totp_generator();
        let mut form = AuthForm::default();
        form.push_opt(FormOpt::new(FormOptKind::Password, "password"));

        generator.generate_at(&mut form, 59).unwrap();
        assert!(form.opt("password").unwrap().value.is_none());
        assert_eq!(generator.tries(), 0);
    }

    #[test]
    fn test_policy_uses_form_message() {
        let mut generator = totp_generator();
        let mut form = token_form(TOTP_FIELD);
        assert!(generator.can_generate(&form, TOTP_FIELD));
        generator.generate_at(&mut form, 59).unwrap();

        form.message = Some("Enter next tokencode".into());
        assert!(generator.can_generate(&form, TOTP_FIELD));
    }
}
