//! Tollgate Client Library
//!
//! Negotiates an authenticated session cookie with a VPN gateway:
//! - `Session`: the login aggregate and its `negotiate_session` driver
//! - `FormHandler`: the callback that shows forms to the user
//! - `CsdHook`: runs the host checker stub when a gateway demands one
//! - `ClientConfig`: the TOML configuration file

pub mod config;
pub mod csd;
pub mod error;
pub mod present;
pub mod session;
pub mod stoken;

pub use config::ClientConfig;
pub use csd::{CsdHook, CsdRequest, CsdState, WrapperHook};
pub use error::{BoxError, ErrorKind, SessionError};
pub use present::{FormHandler, FormOutcome, PresentedForm, PresentedOpt, process_auth_form};
pub use session::{
    ConfigSink, DEFAULT_MAX_REDIRECTS, DEFAULT_USER_AGENT, FileConfigSink, Session,
    SessionBuilder, SessionOptions, user_agent,
};
pub use stoken::{UnlockOutcome, unlock_soft_token};
