use std::time::Duration;

use anyhow::Result;
use tanknet_app::ControlRuntime;
use tanknet_core::TankNetConfig;
use tracing::info;

fn main() -> Result<()> {
    init_tracing();

    let seed = std::env::var("TANKNET_SEED")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok());
    let config = TankNetConfig {
        rng_seed: seed,
        tick_interval_ms: 50,
        ..TankNetConfig::default()
    };

    let runtime = ControlRuntime::start(config)?;
    let handle = runtime.handle().clone();
    info!("starting TankNet simulation shell");
    handle.start()?;

    for _ in 0..40 {
        std::thread::sleep(Duration::from_millis(250));
        let snapshot = handle.snapshot();
        info!(
            step = snapshot.step,
            tanks = snapshot.tanks.len(),
            links = snapshot.links.len(),
            "tick"
        );
    }

    // exercise the destroy path before winding down
    if let Some(first) = handle.snapshot().tanks.first().copied() {
        info!(idx = first.idx, "destroying one tank");
        handle.kill_tank(first.idx)?;
    }
    std::thread::sleep(Duration::from_millis(250));
    let snapshot = handle.snapshot();
    info!(
        step = snapshot.step,
        tanks = snapshot.tanks.len(),
        links = snapshot.links.len(),
        "after destroy"
    );

    handle.stop()?;
    runtime.shutdown();
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
