//! Redirect Integration Tests
//!
//! Location handling, refresh pages and the hop limit.


use gateway_harness::{Gateway, LEGACY_LOGIN, LEGACY_SUCCESS, Reply, ScriptedHandler, Step};
use tollgate_client::{ErrorKind, FormOutcome, Session, SessionError, SessionOptions};

fn legacy() -> SessionOptions {
    SessionOptions {
        xmlpost: false,
        ..Default::default()
    }
}

fn credentials() -> (FormOutcome, Vec<(&'static str, &'static str)>) {
    (
        FormOutcome::Ok,
        vec![("username", "alice"), ("password", "s3cret")],
    )
}

/// Test: Redirect to another host empties the jar and reconnects
#[tokio::test]
async fn test_redirect_across_host() {
    let gateway = Gateway::new([
        Step::Reply(
            Reply::redirect("https://gw2.example.com/login").cookie("webvpnlogin", "1"),
        ),
        Step::Reply(Reply::xml(LEGACY_LOGIN)),
        Step::Reply(Reply::xml(LEGACY_SUCCESS).cookie("webvpn", "C2")),
    ]);
    let (handler, _) = ScriptedHandler::new([credentials()]);

    let mut session = Session::builder(gateway.connector())
        .options(legacy())
        .form_handler(handler)
        .build();
    let cookie = session
        .negotiate_session("https://gw1.example.com/")
        .await
        .unwrap();
    assert_eq!(cookie, "C2");

    let requests = gateway.requests();
    assert_eq!(requests[0].host, "gw1.example.com");
    assert_eq!(requests[1].host, "gw2.example.com");
    assert_eq!(requests[1].path, "/login");
    assert_eq!(requests[1].cookie(), None);

    assert_eq!(
        gateway.connects(),
        [
            ("gw1.example.com".to_string(), 443),
            ("gw2.example.com".to_string(), 443)
        ]
    );
    assert_eq!(gateway.resets(), 1);
    assert_eq!(session.host(), "gw2.example.com");
}

/// Test: Port change counts as a new host
#[tokio::test]
async fn test_redirect_to_new_port() {
    let gateway = Gateway::new([
        Step::Reply(Reply::redirect("https://gw.example.com:8443/").cookie("a", "b")),
        Step::Reply(Reply::xml(LEGACY_LOGIN)),
        Step::Reply(Reply::xml(LEGACY_SUCCESS).cookie("webvpn", "C")),
    ]);
    let (handler, _) = ScriptedHandler::new([credentials()]);

    let mut session = Session::builder(gateway.connector())
        .options(legacy())
        .form_handler(handler)
        .build();
    session
        .negotiate_session("https://gw.example.com/")
        .await
        .unwrap();

    let requests = gateway.requests();
    assert_eq!(requests[1].port, 8443);
    assert_eq!(requests[1].cookie(), None);
    assert_eq!(session.port(), 8443);
}

/// Test: Relative and absolute paths stay on the same connection
#[tokio::test]
async fn test_same_host_redirects() {
    let gateway = Gateway::new([
        Step::Reply(Reply::redirect("login.html").cookie("webvpnlogin", "1")),
        Step::Reply(Reply::redirect("/+CSCOE+/logon.html")),
        Step::Reply(Reply::xml(LEGACY_LOGIN)),
        Step::Reply(Reply::xml(LEGACY_SUCCESS).cookie("webvpn", "C")),
    ]);
    let (handler, _) = ScriptedHandler::new([credentials()]);

    let mut session = Session::builder(gateway.connector())
        .options(legacy())
        .form_handler(handler)
        .build();
    session
        .negotiate_session("https://gw.example.com/+webvpn+/index.html")
        .await
        .unwrap();

    let requests = gateway.requests();
    assert_eq!(requests[1].path, "/+webvpn+/login.html");
    assert_eq!(requests[2].path, "/+CSCOE+/logon.html");
    assert_eq!(requests[2].cookie(), Some("webvpnlogin=1"));
    assert_eq!(gateway.connects().len(), 1);
    assert_eq!(gateway.resets(), 0);
}

/// Test: A closing response forces a fresh connection for the next request
#[tokio::test]
async fn test_connection_close_reconnects() {
    let gateway = Gateway::new([
        Step::Reply(Reply::redirect("/login").close()),
        Step::Reply(Reply::xml(LEGACY_LOGIN)),
        Step::Reply(Reply::xml(LEGACY_SUCCESS).cookie("webvpn", "C")),
    ]);
    let (handler, _) = ScriptedHandler::new([credentials()]);

    let mut session = Session::builder(gateway.connector())
        .options(legacy())
        .form_handler(handler)
        .build();
    session
        .negotiate_session("https://gw.example.com/")
        .await
        .unwrap();
    assert_eq!(gateway.connects().len(), 2);
}

/// Test: Plain http targets are refused
#[tokio::test]
async fn test_non_https_redirect() {
    let gateway = Gateway::new([Step::Reply(Reply::redirect("http://gw.example.com/"))]);
    let mut session = Session::builder(gateway.connector())
        .options(legacy())
        .build();
    let err = session
        .negotiate_session("https://gw.example.com/")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(err.to_string().contains("non-https"));
}

/// Test: Redirect loops stop at the configured limit
#[tokio::test]
async fn test_redirect_limit() {
    let gateway = Gateway::new((0..5).map(|_| Step::Reply(Reply::redirect("/again"))));
    let mut session = Session::builder(gateway.connector())
        .options(SessionOptions {
            xmlpost: false,
            max_redirects: 3,
            ..Default::default()
        })
        .build();
    let err = session
        .negotiate_session("https://gw.example.com/")
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::TooManyRedirects(3)));
    assert_eq!(gateway.requests().len(), 4);
}

/// Test: An error status with no location is a hard failure
#[tokio::test]
async fn test_unexpected_status() {
    let gateway = Gateway::new([Step::Reply(Reply::ok("").status(500))]);
    let mut session = Session::builder(gateway.connector())
        .options(legacy())
        .build();
    let err = session
        .negotiate_session("https://gw.example.com/")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Protocol error: Unexpected 500 result from server");
}

/// Test: HTML refresh pages are re-requested after a pause
#[tokio::test(start_paused = true)]
async fn test_html_refresh() {
    let refresh = r#"<html><head><meta http-equiv="refresh" content="1"></head></html>"#;
    let gateway = Gateway::new([
        Step::Reply(Reply::ok(refresh)),
        Step::Reply(Reply::xml(LEGACY_LOGIN)),
        Step::Reply(Reply::xml(LEGACY_SUCCESS).cookie("webvpn", "C")),
    ]);
    let (handler, _) = ScriptedHandler::new([credentials()]);

    let mut session = Session::builder(gateway.connector())
        .options(legacy())
        .form_handler(handler)
        .build();
    let started = tokio::time::Instant::now();
    session
        .negotiate_session("https://gw.example.com/wait")
        .await
        .unwrap();

    assert!(started.elapsed() >= std::time::Duration::from_secs(1));
    let requests = gateway.requests();
    assert_eq!(requests[0].path, "/wait");
    assert_eq!(requests[1].path, "/wait");
}

/// Test: Anything that is neither XML nor a refresh page is rejected
#[tokio::test]
async fn test_unknown_body() {
    let gateway = Gateway::new([Step::Reply(Reply::ok("<html>hello</html>"))]);
    let mut session = Session::builder(gateway.connector())
        .options(legacy())
        .build();
    let err = session
        .negotiate_session("https://gw.example.com/")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Protocol error: Unknown response from server");
}
