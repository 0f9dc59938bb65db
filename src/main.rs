use smart_energy_meter::{
    operator::OperatorConsole, Config, ControlLoop, FirebaseClient, HostLink, LatchedPin,
    NetworkLink, PzemClient, RelayBank, RemoteStore, RemoteSync, SensorReader,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// Light 1, light 2, outlet 1, outlet 2
const RELAY_GPIOS: [u8; 4] = [27, 26, 25, 33];

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("Smart energy meter starting");

    // Relays go off before anything can fail
    let relays = RelayBank::new(RELAY_GPIOS.map(LatchedPin::new))?;

    let config = Config::from_env()?;
    info!(
        meter = %config.pzem_address,
        database = %config.firebase_url,
        "Configuration loaded"
    );

    let mut sensor = SensorReader::new(PzemClient::new(config.pzem_address, config.pzem_slave));
    sensor.probe().await;

    let mut link = HostLink::for_url(&config.firebase_url, config.remote_timeout);
    if let Err(e) = link.connect(&config.credentials).await {
        warn!("Network link not up yet, the control loop keeps retrying: {}", e);
    }

    let mut firebase = FirebaseClient::new(
        config.firebase_url.clone(),
        config.firebase_auth.clone(),
        config.remote_timeout,
    )?;
    if let Err(e) = firebase.begin().await {
        warn!("Firebase not ready at startup: {}", e);
    }

    let (console, commands) = OperatorConsole::stdin();
    console.spawn();
    info!("Type 'r' and Enter to reset the session energy counter");

    let mut control_loop = ControlLoop::new(
        config.timing,
        config.credentials,
        sensor,
        relays,
        RemoteSync::new(firebase),
        link,
        commands,
    );
    control_loop.run().await;

    Ok(())
}
