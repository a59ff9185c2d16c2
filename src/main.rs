use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, info};

use gsend::cli::Cli;
use gsend::config::{self, HTTP_TIMEOUT};
use gsend::gmail_api::{HttpTokenRefresher, LocalServerFlow, Session};
use gsend::{send, SendError};

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;

    let client = match &cli.client_secret {
        Some(path) => config::load_client_secret(path).await?,
        None => config::default_client_secret(),
    };
    let flow = LocalServerFlow::from_env(http.clone())
        .with_browser(!cli.no_browser)
        .with_timeout(cli.auth_timeout.map(Duration::from_secs));
    let session = Session::new(
        cli.credentials_path(),
        config::default_scopes(),
        client,
        flow,
        HttpTokenRefresher::new(http.clone()),
    );

    let body = cli.read_body().await?;
    let options = cli.send_options(body);

    let completed = send(&options, &session, &http).await?;
    if let Some(e) = completed.save_error {
        eprintln!(
            "Warning: the message was handled but the credentials could not be saved to {}: {}",
            session.path().display(),
            e
        );
    }
    match completed.output {
        Some(id) => info!("Message {} sent", id),
        None => info!("Dry run finished"),
    }
    Ok(())
}

fn report(err: &(dyn std::error::Error + 'static)) -> String {
    match err.downcast_ref::<SendError>() {
        Some(e @ SendError::SubjectUsed(_)) => e.to_string(),
        _ => format!("Internal Error: {}", err),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    gsend::logging::init(cli.verbose);
    debug!("The given parameters are: {:#?}", cli);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            debug!("{:?}", e);
            eprintln!("Error: {}", report(e.as_ref()));
            ExitCode::FAILURE
        }
    }
}
