use tracing::info;

use weather_gate::{
    cron, routes,
    setup::{run_server, setup_sentry, setup_tracing},
    AppState,
};

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    // Initialize Sentry for error tracking
    let _sentry_guard = setup_sentry();

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()?
        .block_on(async { run_application().await })
}

async fn run_application() -> color_eyre::Result<()> {
    setup_tracing("weather_gate")?;

    println!("\n========== WEATHER GATE STARTING ==========");
    let app_state = AppState::from_env()?;

    info!("Spawning application tasks");
    let futures = spawn_application_tasks(app_state);

    for result in futures::future::try_join_all(futures).await? {
        result?;
    }

    Ok(())
}

fn spawn_application_tasks(
    app_state: AppState,
) -> Vec<tokio::task::JoinHandle<color_eyre::Result<()>>> {
    let mut futures = vec![];

    if is_feature_enabled("SERVER") {
        info!("Server Enabled");
        futures.push(tokio::spawn(run_server(routes::routes(app_state.clone()))));
    } else {
        info!("Server Disabled");
    }

    if is_feature_enabled("SWEEPER") {
        info!("Sweeper Enabled");
        futures.push(tokio::spawn(cron::run_sweeper(app_state.clone())));
    } else {
        info!("Sweeper Disabled");
    }

    info!("All application tasks spawned successfully");
    futures
}

/// Check if a feature is enabled based on environment variables
fn is_feature_enabled(feature: &str) -> bool {
    std::env::var(format!("{}_DISABLED", feature)).unwrap_or_else(|_| "false".to_string()) != "true"
}
