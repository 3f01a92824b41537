//! Host Checker Integration Tests
//!
//! Stub download, hook invocation and the wait page, in both body encodings.


use async_trait::async_trait;
use gateway_harness::{
    Gateway, LEGACY_LOGIN, LEGACY_SUCCESS, Reply, STRUCTURED_LOGIN, STRUCTURED_SUCCESS,
    ScriptedHandler, Step,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tollgate_client::{BoxError, CsdHook, CsdRequest, ErrorKind, FormOutcome, Session, SessionOptions};

const STUB: &str = "#!/bin/sh\nexit 0\n";

const LEGACY_CSD: &str = r#"<auth id="main">
  <csd token="CSDTOKEN" ticket="TICKET-9"/>
  <csdLinux stuburl="/CACHE/sdesktop/install/binaries/sfinst" starturl="/CACHE/sdesktop/install/start.htm" waiturl="/+CSCOE+/sdesktop/wait.html"/>
  <csdMac stuburl="/CACHE/sdesktop/install/binaries/macinst" starturl="/mac/start.htm" waiturl="/mac/wait.html"/>
</auth>"#;

const STRUCTURED_CSD: &str = r#"<config-auth client="vpn" type="auth-request">
  <opaque is-for="sg"><tunnel-group>corp</tunnel-group></opaque>
  <host-scan>
    <host-scan-ticket>TICKET-7</host-scan-ticket>
    <host-scan-token>SCANTOKEN</host-scan-token>
    <host-scan-base-uri>/+CSCOE+/sdesktop/token.xml</host-scan-base-uri>
    <host-scan-wait-uri>/+CSCOE+/sdesktop/wait.html</host-scan-wait-uri>
  </host-scan>
  <auth id="main"><message>Please wait while your host is checked.</message></auth>
</config-auth>"#;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Invocation {
    script: Vec<u8>,
    ticket: String,
    group: String,
    host: String,
    start_url: String,
}

#[derive(Default)]
struct HookLog {
    runs: Vec<Invocation>,
    cleanups: usize,
}

/// Records every stub it is asked to run
struct RecordingHook {
    log: Arc<Mutex<HookLog>>,
    fail: bool,
}

impl RecordingHook {
    fn new() -> (Self, Arc<Mutex<HookLog>>) {
        let log = Arc::new(Mutex::new(HookLog::default()));
        (
            Self {
                log: log.clone(),
                fail: false,
            },
            log,
        )
    }
}

#[async_trait]
impl CsdHook for RecordingHook {
    async fn run(&mut self, request: &CsdRequest<'_>) -> Result<(), BoxError> {
        self.log.lock().runs.push(Invocation {
            script: request.script.to_vec(),
            ticket: request.ticket.to_string(),
            group: request.group.to_string(),
            host: request.host.to_string(),
            start_url: request.start_url.to_string(),
        });
        if self.fail {
            return Err("wrapper exited with status 1".into());
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        self.log.lock().cleanups += 1;
    }
}

fn linux(xmlpost: bool) -> SessionOptions {
    SessionOptions {
        xmlpost,
        csd_tag: "csdLinux".to_string(),
        ..Default::default()
    }
}

fn credentials() -> (FormOutcome, Vec<(&'static str, &'static str)>) {
    (
        FormOutcome::Ok,
        vec![("username", "alice"), ("password", "s3cret")],
    )
}

/// Test: Legacy CSD downloads the stub, runs it, then waits with the token cookie
#[tokio::test]
async fn test_legacy_host_checker() {
    let gateway = Gateway::new([
        Step::Reply(Reply::xml(LEGACY_CSD).cookie("webvpnlogin", "1")),
        Step::Reply(Reply::ok(STUB)),
        Step::Reply(Reply::xml(LEGACY_LOGIN)),
        Step::Reply(Reply::xml(LEGACY_SUCCESS).cookie("webvpn", "C")),
    ]);
    let (hook, log) = RecordingHook::new();
    let (handler, _) = ScriptedHandler::new([credentials()]);

    let mut session = Session::builder(gateway.connector())
        .options(linux(false))
        .form_handler(handler)
        .csd_hook(hook)
        .build();
    let cookie = session
        .negotiate_session("https://gw.example.com/")
        .await
        .unwrap();
    assert_eq!(cookie, "C");

    let requests = gateway.requests();
    assert_eq!(requests.len(), 4);
    assert_eq!(requests[1].method, "GET");
    assert_eq!(requests[1].path, "/CACHE/sdesktop/install/binaries/sfinst");
    // Jar is emptied before the stub is fetched
    assert_eq!(requests[1].cookie(), None);
    assert_eq!(requests[2].method, "GET");
    assert_eq!(requests[2].path, "/+CSCOE+/sdesktop/wait.html");
    assert_eq!(requests[2].cookie(), Some("sdesktop=CSDTOKEN"));
    assert_eq!(requests[3].path, "/+webvpn+/index.html");

    let log = log.lock();
    assert_eq!(
        log.runs,
        [Invocation {
            script: STUB.as_bytes().to_vec(),
            ticket: "TICKET-9".to_string(),
            group: String::new(),
            host: "gw.example.com".to_string(),
            start_url: "https://gw.example.com/CACHE/sdesktop/install/start.htm".to_string(),
        }]
    );
    assert_eq!(log.cleanups, 1);
    assert!(session.csd().done);
    assert_eq!(session.csd().waiturl, None);
}

/// Test: With stub download disabled the start page is fetched instead
#[tokio::test]
async fn test_legacy_host_checker_nostub() {
    let gateway = Gateway::new([
        Step::Reply(Reply::xml(LEGACY_CSD)),
        Step::Reply(Reply::ok(STUB)),
        Step::Reply(Reply::xml(LEGACY_SUCCESS).cookie("webvpn", "C")),
    ]);
    let (hook, log) = RecordingHook::new();

    let mut session = Session::builder(gateway.connector())
        .options(SessionOptions {
            csd_nostub: true,
            ..linux(false)
        })
        .csd_hook(hook)
        .build();
    session
        .negotiate_session("https://gw.example.com/")
        .await
        .unwrap();

    let requests = gateway.requests();
    assert_eq!(requests[1].path, "/CACHE/sdesktop/install/start.htm");
    assert_eq!(log.lock().runs.len(), 1);
}

/// Test: Only the element for this platform is honoured
#[tokio::test]
async fn test_other_platform_ignored() {
    let gateway = Gateway::new([
        Step::Reply(Reply::xml(LEGACY_CSD)),
        Step::Reply(Reply::ok(STUB)),
        Step::Reply(Reply::xml(LEGACY_SUCCESS).cookie("webvpn", "C")),
    ]);
    let (hook, _) = RecordingHook::new();

    let mut session = Session::builder(gateway.connector())
        .options(SessionOptions {
            csd_tag: "csdMac".to_string(),
            ..linux(false)
        })
        .csd_hook(hook)
        .build();
    session
        .negotiate_session("https://gw.example.com/")
        .await
        .unwrap();

    let requests = gateway.requests();
    assert_eq!(requests[1].path, "/CACHE/sdesktop/install/binaries/macinst");
    assert_eq!(requests[2].path, "/mac/wait.html");
}

/// Test: A gateway demanding CSD without a hook is unsupported
#[tokio::test]
async fn test_host_checker_without_hook() {
    let gateway = Gateway::new([Step::Reply(Reply::xml(LEGACY_CSD))]);

    let mut session = Session::builder(gateway.connector())
        .options(linux(false))
        .build();
    let err = session
        .negotiate_session("https://gw.example.com/")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    assert_eq!(gateway.requests().len(), 1);
}

/// Test: A failing stub aborts the login and the hook is still cleaned up
#[tokio::test]
async fn test_host_checker_failure() {
    let gateway = Gateway::new([
        Step::Reply(Reply::xml(LEGACY_CSD)),
        Step::Reply(Reply::ok(STUB)),
    ]);
    let (mut hook, log) = RecordingHook::new();
    hook.fail = true;

    let mut session = Session::builder(gateway.connector())
        .options(linux(false))
        .csd_hook(hook)
        .build();
    let err = session
        .negotiate_session("https://gw.example.com/")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Handler);
    assert_eq!(log.lock().cleanups, 1);
    assert!(!session.csd().done);
}

/// Test: Structured host scan echoes its token in the auth reply
#[tokio::test]
async fn test_structured_host_scan() {
    let gateway = Gateway::new([
        Step::Reply(Reply::xml(STRUCTURED_CSD)),
        Step::Reply(Reply::ok(STUB)),
        Step::Reply(Reply::xml(STRUCTURED_LOGIN)),
        Step::Reply(Reply::xml(STRUCTURED_SUCCESS)),
    ]);
    let (hook, log) = RecordingHook::new();
    let (handler, _) = ScriptedHandler::new([credentials()]);

    let mut session = Session::builder(gateway.connector())
        .options(linux(true))
        .form_handler(handler)
        .csd_hook(hook)
        .build();
    let cookie = session
        .negotiate_session("https://gw.example.com/")
        .await
        .unwrap();
    assert_eq!(cookie, "TOKEN-1234");

    let requests = gateway.requests();
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[1].method, "GET");
    assert_eq!(requests[1].path, "/+CSCOE+/sdesktop/token.xml");
    assert_eq!(requests[2].path, "/+CSCOE+/sdesktop/wait.html");
    assert_eq!(requests[2].cookie(), Some("sdesktop=SCANTOKEN"));
    assert!(requests[3].body.contains("<host-scan-token>SCANTOKEN</host-scan-token>"));

    let log = log.lock();
    assert_eq!(log.runs[0].ticket, "TICKET-7");
    assert_eq!(
        log.runs[0].start_url,
        "https://gw.example.com/+CSCOE+/sdesktop/token.xml"
    );
}
