// src/main.rs
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use rtsess::{fn_run_session, CoreConfig, Credentials, ProxyInfo, SessionSettings, Subscription};
use rtsess::dat::{DEFAULT_APP_ID, DEFAULT_AUTH_URL, DEFAULT_POSITION, DEFAULT_RIC, DEFAULT_SCOPE, DEFAULT_SERVICE};
use tokio::sync::mpsc;

/// Keeps an authenticated market-data stream alive, renewing its token in place.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Gateway host name.
    #[clap(long, env = "RTSESS_HOSTNAME")]
    hostname: String,

    /// Gateway port.
    #[clap(long, default_value_t = 443, env = "RTSESS_PORT")]
    port: u16,

    /// Application id sent in the login request.
    #[clap(long, default_value = DEFAULT_APP_ID, env = "RTSESS_APP_ID")]
    app_id: String,

    /// Machine id or user name.
    #[clap(long, env = "RTSESS_USER")]
    user: String,

    /// Password for the user.
    #[clap(long, env = "RTSESS_PASSWORD", hide_env_values = true)]
    password: String,

    /// Replace the password once, during the first authentication.
    #[clap(long, env = "RTSESS_NEW_PASSWORD", hide_env_values = true)]
    new_password: Option<String>,

    /// OAuth client id.
    #[clap(long, env = "RTSESS_CLIENT_ID")]
    clientid: String,

    /// Position (originating address) for the login request.
    #[clap(long, default_value = DEFAULT_POSITION, env = "RTSESS_POSITION")]
    position: String,

    /// Token endpoint.
    #[clap(long, default_value = DEFAULT_AUTH_URL, env = "RTSESS_AUTH_URL")]
    auth_url: String,

    /// Requested token scope.
    #[clap(long, default_value = DEFAULT_SCOPE, env = "RTSESS_SCOPE")]
    scope: String,

    /// Item to subscribe to.
    #[clap(long, default_value = DEFAULT_RIC, env = "RTSESS_RIC")]
    ric: String,

    /// Service providing the item.
    #[clap(long, default_value = DEFAULT_SERVICE, env = "RTSESS_SERVICE")]
    service: String,

    /// HTTP proxy host for token requests.
    #[clap(long, requires = "proxy_port", env = "RTSESS_PROXY_HOST")]
    proxy_host: Option<String>,

    /// HTTP proxy port for token requests.
    #[clap(long, requires = "proxy_host", env = "RTSESS_PROXY_PORT")]
    proxy_port: Option<u16>,
}

impl Args {
    fn into_settings(self) -> SessionSettings {
        let creds = Credentials {
            username: self.user,
            client_id: self.clientid,
            password: self.password,
            scope: self.scope,
            app_id: self.app_id,
            position: self.position,
        };
        let mut settings = SessionSettings::new(self.hostname, creds);
        settings.port = self.port;
        settings.auth_url = self.auth_url;
        settings.subscription = Subscription { ric: self.ric, service: self.service };
        settings.new_password = self.new_password;
        settings.proxy = match (self.proxy_host, self.proxy_port) {
            (Some(host), Some(port)) => Some(ProxyInfo { host, port }),
            _ => None,
        };
        settings
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match start(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn start(args: Args) -> Result<()> {
    let settings = args.into_settings();
    log::info!("Starting session for {} against {}", settings.creds.username, settings.ws_url());

    let (error_tx, mut error_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<String>(1);
    let (data_tx, mut data_rx) = mpsc::channel(1024);
    let config = CoreConfig { error_tx, shutdown_rx, data_tx: Some(data_tx) };

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send("interrupt".to_string()).await;
        }
        // keep the sender alive until the session is gone
        shutdown_tx.closed().await;
    });
    tokio::spawn(async move {
        while let Some(msg) = data_rx.recv().await {
            log::info!("{:?} id={:?} key={:?} fields={}", msg.msg_type, msg.id, msg.key, serde_json::Value::Object(msg.extra.into_iter().collect()));
        }
    });
    tokio::spawn(async move {
        while let Some(err) = error_rx.recv().await {
            log::warn!("session reported: {err:?}");
        }
    });

    fn_run_session(settings, config).await
}
