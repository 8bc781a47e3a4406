#![deny(clippy::all)]
#![deny(clippy::dbg_macro)]

use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Error;
use asset_tracker::{config::TrackerConfig, controller::BalancesController};
use env_logger::{Builder, Env};
use log::{error, info};
use std::sync::Arc;
use structopt::StructOpt;

mod api;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "Asset tracker API params",
    about = "Advanced parameters for the multi-chain asset tracker API."
)]
struct Opt {
    /// Set logging level
    #[structopt(short, long, default_value = "warn")]
    log: String,

    /// Set IP address
    #[structopt(long, short, default_value = "127.0.0.1")]
    ip: String,

    /// Set port number
    #[structopt(long, short, default_value = "8080")]
    port: u16,
}

#[tokio::main]
async fn main() -> ! {
    dotenv::dotenv().ok();

    let opt = Opt::from_args();

    Builder::from_env(Env::default().default_filter_or(opt.log)).init();

    let (controller, poll_interval) = match build_controller() {
        Ok(built) => built,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    controller.spawn_registry_listener();
    controller.start_polling(poll_interval);

    loop {
        if let Err(e) = try_main(&opt.ip, opt.port, controller.clone()).await {
            error!("{e}");
        } else {
            info!("Exiting gracefully");
            std::process::exit(0);
        }
    }
}

fn build_controller() -> Result<(Arc<BalancesController>, std::time::Duration), Error> {
    let config = TrackerConfig::from_env()?;

    info!(
        "Tracking {} chains, {} configured accounts",
        config.chains.len(),
        config.accounts.len()
    );

    Ok((
        Arc::new(BalancesController::from_config(&config)?),
        config.poll_interval,
    ))
}

async fn try_main(ip: &str, port: u16, controller: Arc<BalancesController>) -> Result<(), Error> {
    info!("Listening on http://{}:{}", ip, port);

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(web::Data::new(controller.clone()))
            .configure(api::router::configure)
    })
    .bind((ip, port))
    .map_err(Error::msg)?
    .run()
    .await
    .map_err(Error::msg)
}
