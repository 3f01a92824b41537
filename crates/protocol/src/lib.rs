//! Tollgate Protocol - Gateway auth exchange definitions
//!
//! This crate defines the data structures and codecs of the login exchange:
//! - `AuthForm`/`FormOpt`: The form model the gateway asks the user to fill in
//! - `Element`: A small owned XML tree with a recovering parser
//! - `parse_auth_response`: Gateway XML reply to form (or cert request)
//! - `encode_legacy`/`encode_structured`: Completed form to request body
//! - `KeepaliveState`: Rekey/DPD/keepalive timer decisions for a live tunnel
//!
//! Nothing here does I/O.

mod encode;
mod form;
mod keepalive;
mod parse;
mod xml;

pub use encode::*;
pub use form::*;
pub use keepalive::*;
pub use parse::*;
pub use xml::*;
