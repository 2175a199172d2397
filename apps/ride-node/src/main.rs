use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ride_match::geohash;
use ride_match::{
    Coordinates, MatchingEvent, NodeConfig, NostrRelayClient, RideMatchingService, RideRequest,
    RiderPhase,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

/// Join the ride matching network as a rider or a driver.
///
/// Relays, keys and protocol timing come from `RIDE_MATCH_*` environment variables.
#[derive(Parser, Debug)]
#[command(name = "ride-node", version)]
struct Args {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Publish a ride request and wait for drivers.
    Rider {
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,
        /// Request id; generated when omitted.
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        note: Option<String>,
        /// Confirm the first driver that accepts.
        #[arg(long)]
        auto_confirm: bool,
    },
    /// Announce availability and watch nearby requests.
    Driver {
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,
        /// Accept every request that appears.
        #[arg(long)]
        auto_accept: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = NodeConfig::from_env().context("load node configuration")?;
    let precision = config.matching.geohash_precision;

    let relay = Arc::new(NostrRelayClient::new(
        config.keypair.clone(),
        config.relays.clone(),
    ));
    relay.connect_in_background();
    let (service, events) = RideMatchingService::with_channel(relay, config.matching.clone());
    info!(pubkey = %service.public_key(), relays = ?config.relays, "ride node starting");

    match args.mode {
        Mode::Rider {
            lat,
            lon,
            id,
            note,
            auto_confirm,
        } => {
            let cell = geohash::encode(lat, lon, precision);
            let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let mut request =
                RideRequest::new(id, cell.clone()).with_pickup(Coordinates::new(lat, lon));
            if let Some(note) = note {
                request = request.with_note(note);
            }
            let request = service
                .start_as_rider(&cell, request)
                .await
                .context("start rider session")?;
            info!(request_id = %request.id, cell = %cell, "waiting for drivers");
            run_rider(&service, events, auto_confirm).await?;
        }
        Mode::Driver {
            lat,
            lon,
            auto_accept,
        } => {
            let cell = geohash::encode(lat, lon, precision);
            service
                .start_as_driver(&cell, Coordinates::new(lat, lon))
                .await
                .context("start driver session")?;
            info!(cell = %cell, "watching for ride requests");
            run_driver(&service, events, auto_accept).await?;
        }
    }

    service.stop().await.context("stop matching session")?;
    Ok(())
}

async fn run_rider(
    service: &RideMatchingService,
    mut events: UnboundedReceiver<MatchingEvent>,
    auto_confirm: bool,
) -> Result<()> {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            signal = tokio::signal::ctrl_c() => {
                signal.context("listen for ctrl-c")?;
                info!("interrupted");
                return Ok(());
            }
        };
        let Some(event) = event else {
            return Ok(());
        };
        match event {
            MatchingEvent::DriverAccepted {
                request_id,
                driver_pubkey,
            } => {
                info!(request_id = %request_id, driver = %driver_pubkey, "driver accepted");
                if !auto_confirm || service.rider_phase() != RiderPhase::Open {
                    continue;
                }
                let Some(request) = service.active_request() else {
                    continue;
                };
                match service.confirm_match(&request, &driver_pubkey).await {
                    Ok(_) => return Ok(()),
                    Err(error) => warn!(request_id = %request_id, "confirm failed: {}", error),
                }
            }
            MatchingEvent::DriverCountChanged(count) => info!(count, "drivers nearby"),
            MatchingEvent::RelayCountChanged(count) => info!(count, "relays connected"),
            MatchingEvent::RequestExpired { request_id } => {
                warn!(request_id = %request_id, "request expired; giving up");
                return Ok(());
            }
            MatchingEvent::RequestAppeared(_) | MatchingEvent::RequestGone { .. } => {}
        }
    }
}

async fn run_driver(
    service: &RideMatchingService,
    mut events: UnboundedReceiver<MatchingEvent>,
    auto_accept: bool,
) -> Result<()> {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            signal = tokio::signal::ctrl_c() => {
                signal.context("listen for ctrl-c")?;
                info!("interrupted");
                return Ok(());
            }
        };
        let Some(event) = event else {
            return Ok(());
        };
        match event {
            MatchingEvent::RequestAppeared(request) => {
                info!(
                    request_id = %request.id,
                    rider = %request.pubkey,
                    note = request.note.as_deref().unwrap_or(""),
                    "ride request"
                );
                if auto_accept
                    && let Err(error) = service.accept_request(&request.pubkey, &request.id).await
                {
                    warn!(request_id = %request.id, "accept failed: {}", error);
                }
            }
            MatchingEvent::RequestGone {
                rider_pubkey,
                request_id,
                matched_driver_pubkey,
            } => {
                let won = matched_driver_pubkey.as_deref() == Some(service.public_key().as_str());
                info!(
                    request_id = %request_id,
                    rider = %rider_pubkey,
                    matched = ?matched_driver_pubkey,
                    won,
                    "ride request gone"
                );
            }
            MatchingEvent::RelayCountChanged(count) => info!(count, "relays connected"),
            MatchingEvent::DriverAccepted { .. }
            | MatchingEvent::DriverCountChanged(_)
            | MatchingEvent::RequestExpired { .. } => {}
        }
    }
}
