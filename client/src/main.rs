//! Tollgate Client
//!
//! Logs in to a VPN gateway and prints the session cookie.

mod prompt;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use prompt::TerminalHandler;
use tollgate_client::config::{ClientConfig, TokenMode};
use tollgate_client::{FileConfigSink, Session, WrapperHook};
use tollgate_crypto::TokenGenerator;
use tollgate_transport::{ProxyConfig, TlsConnector, build_tls_config, cancel_pair};

/// Tollgate - VPN gateway login
#[derive(Parser, Debug)]
#[command(name = "tollgate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "tollgate.toml")]
    config: String,

    /// Debug output
    #[arg(short, long)]
    verbose: bool,

    /// Trace output, including HTTP exchanges
    #[arg(long)]
    trace: bool,

    /// Auth group to select
    #[arg(short = 'g', long)]
    authgroup: Option<String>,

    /// Send query-string bodies instead of XML
    #[arg(long)]
    no_xmlpost: bool,

    /// One-time code generator
    #[arg(long, value_enum)]
    token_mode: Option<TokenMode>,

    /// Secret for the one-time code generator
    #[arg(long)]
    token_secret: Option<String>,

    /// Proxy URL (http://, socks://, socks5://)
    #[arg(short = 'P', long)]
    proxy: Option<String>,

    /// Username to fill in
    #[arg(short, long)]
    user: Option<String>,

    /// Gateway URL
    server: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.trace {
        "trace"
    } else if args.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Tollgate Client v{}", env!("CARGO_PKG_VERSION"));

    let mut config = if Path::new(&args.config).exists() {
        let config = ClientConfig::load(&args.config)
            .await
            .with_context(|| format!("Failed to load {}", args.config))?;
        info!("Loaded configuration from {}", args.config);
        config
    } else {
        ClientConfig::default()
    };

    if args.authgroup.is_some() {
        config.gateway.authgroup = args.authgroup;
    }
    if args.no_xmlpost {
        config.gateway.xmlpost = false;
    }
    if let Some(mode) = args.token_mode {
        config.token.mode = mode;
    }
    if args.token_secret.is_some() {
        config.token.secret = args.token_secret;
    }
    if args.proxy.is_some() {
        config.proxy.url = args.proxy;
    }

    let url = args
        .server
        .or_else(|| config.gateway.url.clone())
        .context("No gateway URL given")?;

    let options = config.session_options();
    let tls = build_tls_config(config.tls.ca_file.as_deref())?;
    let mut connector = TlsConnector::new(tls, options.useragent.clone());
    if let Some(proxy) = &config.proxy.url {
        connector = connector.with_proxy(ProxyConfig::from_url(proxy)?);
    }

    let (canceller, cancel) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling login");
            canceller.cancel();
        }
    });

    let mut builder = Session::builder(connector)
        .options(options)
        .form_handler(TerminalHandler::new(args.user))
        .tokens(TokenGenerator::new(config.token_backend()?))
        .authgroup(config.gateway.authgroup.clone())
        .cancel_token(cancel);
    if let Some(wrapper) = &config.csd.wrapper {
        builder = builder.csd_hook(WrapperHook::new(wrapper));
    }
    if let Some(path) = &config.gateway.config_out {
        builder = builder.config_sink(FileConfigSink::new(path));
    }
    let mut session = builder.build();

    let cookie = session.negotiate_session(&url).await?;
    session.close().await;

    println!("COOKIE='{}'", cookie);
    if session.port() == 443 {
        println!("HOST='{}'", session.host());
    } else {
        println!("HOST='{}:{}'", session.host(), session.port());
    }
    if let Some(group) = session.authgroup() {
        println!("AUTHGROUP='{}'", group);
    }

    Ok(())
}
