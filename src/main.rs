mod config;
mod download;
mod error;
mod handlers;
mod models;
mod normalize;
mod provider;
mod value;

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use config::{Cli, Command, ServeArgs};
use handlers::AppState;
use provider::{InferenceProvider, OnnxProvider};

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(true)
        .init();

    match cli.command.unwrap_or_else(|| Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => actix_web::rt::System::new().block_on(serve(args)),
        Command::Download(args) => download::download(&args),
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    // The server still starts without a model; /ping reports it and /predict
    // answers with an error.
    let provider: Option<Arc<dyn InferenceProvider>> =
        match OnnxProvider::load(&args.provider_settings()) {
            Ok(provider) => {
                info!(
                    model = %args.model.display(),
                    classes = provider.names().len(),
                    "Model ready"
                );
                Some(Arc::new(provider))
            }
            Err(e) => {
                error!(model = %args.model.display(), error = %e, "Failed to load model");
                None
            }
        };

    let state = web::Data::new(AppState {
        provider,
        settings: args.settings(),
    });

    info!("Server running at http://{}:{}", args.host, args.port);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header();

        App::new()
            .wrap(cors)
            .wrap(Logger::default())
            .app_data(state.clone())
            .configure(handlers::configure)
    })
    .bind((args.host.as_str(), args.port))?
    .run()
    .await?;

    Ok(())
}
