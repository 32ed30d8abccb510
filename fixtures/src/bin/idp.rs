use clap::Parser;
use fixtures::{idp, run_server, FixtureArgs, IdpSettings, IdpState};

/// Identity provider fixture server
#[derive(Parser, Debug)]
#[clap(name = "idp-fixture")]
struct Cli {
    #[clap(flatten)]
    common: FixtureArgs,

    /// Client id the fixture accepts
    #[arg(long, default_value = "fixture-client")]
    client_id: String,

    /// Client secret the fixture accepts
    #[arg(long, default_value = "fixture-secret")]
    client_secret: String,

    /// Audience stamped into access tokens when the authorize request names none
    #[arg(long)]
    audience: Option<String>,

    /// Issuer URL to advertise, defaults to http://{host}:{port}/
    #[arg(long)]
    issuer: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let issuer = match args.issuer {
        Some(issuer) => issuer,
        None if args.common.port == 0 => {
            anyhow::bail!("--port is required when --issuer is not given")
        }
        None => format!("http://{}:{}/", args.common.host, args.common.port),
    };

    let settings = IdpSettings {
        client_id: args.client_id,
        client_secret: args.client_secret,
        audience: args.audience,
        ..Default::default()
    };

    let app = idp::router(IdpState::new(issuer, settings));

    run_server(args.common, app).await
}
