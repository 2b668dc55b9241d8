use std::sync::Arc;

use satchel::storage::SqliteRepository;
use satchel::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = Config::from_env()?;

    // CLI flags mirror the environment variables.
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" => {
                let value = args.next().ok_or("missing value for --port")?;
                config.port = value.parse().map_err(|_| format!("invalid port: {value}"))?;
            }
            "--data-dir" => {
                config.data_dir = args.next().ok_or("missing value for --data-dir")?.into();
            }
            "--cors-origins" => {
                let value = args.next().ok_or("missing value for --cors-origins")?;
                config.allowed_origins = value
                    .split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect();
            }
            "--openai-api-key" => {
                config.openai_api_key =
                    Some(args.next().ok_or("missing value for --openai-api-key")?);
            }
            "--anthropic-api-key" => {
                config.anthropic_api_key =
                    Some(args.next().ok_or("missing value for --anthropic-api-key")?);
            }
            "--gemini-api-key" => {
                config.gemini_api_key =
                    Some(args.next().ok_or("missing value for --gemini-api-key")?);
            }
            other => {
                return Err(format!(
                    "unknown arg: {other}\nusage: satchel-gateway [--port PORT] \
                     [--data-dir DIR] [--cors-origins A,B] [--openai-api-key KEY] \
                     [--anthropic-api-key KEY] [--gemini-api-key KEY]"
                )
                .into())
            }
        }
    }

    std::fs::create_dir_all(&config.data_dir)?;
    let repo = SqliteRepository::new(config.database_path());
    repo.init().await?;

    let state = satchel::build_app_state(Arc::new(repo), &config);
    let app = satchel::http::router(state).layer(satchel::http::cors_layer(&config.allowed_origins));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(port = config.port, "satchel gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}
