//! Host checker (CSD) control flow
//!
//! The gateway may ask the client to download and run a host-scan stub
//! before it continues the login. Only the control flow lives here: the
//! stub itself is handed to a [`CsdHook`].

use crate::error::BoxError;
use async_trait::async_trait;
use std::io::Write;
use std::path::PathBuf;
use tempfile::TempPath;
use tollgate_protocol::CsdUpdate;
use tokio::process::Command;
use tracing::{debug, info};

/// Host checker state gathered across responses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsdState {
    pub token: Option<String>,
    pub ticket: Option<String>,
    pub stuburl: Option<String>,
    pub starturl: Option<String>,
    pub waiturl: Option<String>,

    /// The stub has run; later CSD elements are ignored
    pub done: bool,
}

impl CsdState {
    /// Merge what the latest response carried
    pub fn apply(&mut self, update: CsdUpdate) {
        if update.token.is_some() {
            self.token = update.token;
        }
        if update.ticket.is_some() {
            self.ticket = update.ticket;
        }
        if update.stuburl.is_some() {
            self.stuburl = update.stuburl;
        }
        if update.starturl.is_some() {
            self.starturl = update.starturl;
        }
        if update.waiturl.is_some() {
            self.waiturl = update.waiturl;
        }
    }

    /// Everything needed to run the stub is known
    pub fn is_complete(&self) -> bool {
        self.token.is_some()
            && self.ticket.is_some()
            && self.starturl.is_some()
            && self.waiturl.is_some()
    }

    /// Where the stub is downloaded from
    pub fn stub_location(&self) -> Option<&str> {
        self.stuburl.as_deref().or(self.starturl.as_deref())
    }
}

/// One stub invocation
#[derive(Debug, Clone, Copy)]
pub struct CsdRequest<'a> {
    pub script: &'a [u8],
    pub ticket: &'a str,
    pub group: &'a str,
    pub host: &'a str,
    /// `https://<host><starturl>`
    pub start_url: &'a str,
}

/// Runs the host checker stub
#[async_trait]
pub trait CsdHook: Send {
    async fn run(&mut self, request: &CsdRequest<'_>) -> Result<(), BoxError>;

    /// Release whatever `run` left behind; called once login finishes
    fn cleanup(&mut self) {}
}

/// Writes the stub to a temporary file and starts a wrapper program on it
///
/// The wrapper is started and left running; the script file is removed on
/// [`CsdHook::cleanup`].
pub struct WrapperHook {
    wrapper: PathBuf,
    script: Option<TempPath>,
}

impl WrapperHook {
    pub fn new(wrapper: impl Into<PathBuf>) -> Self {
        Self {
            wrapper: wrapper.into(),
            script: None,
        }
    }

    /// Arguments passed to the wrapper after the script path
    pub fn arguments(request: &CsdRequest<'_>) -> Vec<String> {
        vec![
            "-ticket".to_string(),
            format!("\"{}\"", request.ticket),
            "-stub".to_string(),
            "\"0\"".to_string(),
            "-group".to_string(),
            format!("\"{}\"", request.group),
            "-certhash".to_string(),
            "\":\"".to_string(),
            "-url".to_string(),
            format!("\"{}\"", request.start_url),
            "-langselen".to_string(),
        ]
    }
}

#[async_trait]
impl CsdHook for WrapperHook {
    async fn run(&mut self, request: &CsdRequest<'_>) -> Result<(), BoxError> {
        let mut file = tempfile::Builder::new().prefix("csd").tempfile()?;
        file.write_all(request.script)?;
        file.flush()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o755))?;
        }
        let path = file.into_temp_path();

        info!("Running CSD wrapper {}", self.wrapper.display());
        let child = Command::new(&self.wrapper)
            .arg(&*path)
            .args(Self::arguments(request))
            .spawn()?;
        debug!("CSD wrapper started (pid {:?})", child.id());

        self.script = Some(path);
        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some(path) = self.script.take() {
            if let Err(e) = path.close() {
                debug!("Failed to remove CSD script: {}", e);
            }
        }
    }
}
