use std::env;
use std::process::ExitCode;

use lens_driver::{LensConfig, LensDriver, LensMode, Result};
use log::{error, warn};

const DEFAULT_PORT: &str = "/dev/optotune_ld";

fn demo(lens: &mut LensDriver) -> Result<()> {
    println!("Getting temperature...");
    let temp = lens.get_temperature()?;
    println!("Temperature: {}°C", temp);

    println!("Setting current mode...");
    lens.set_mode(LensMode::Current)?;
    lens.set_current(50.0)?;

    println!("Setting focal power mode...");
    if let Some(range) = lens.set_mode(LensMode::FocalPower)? {
        println!("Focal power range: {} to {}", range.min, range.max);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let port = env::args()
        .nth(1)
        .or_else(|| env::var("LENS_DRIVER_PORT").ok())
        .unwrap_or_else(|| DEFAULT_PORT.to_string());

    let opened = tokio::task::spawn_blocking(move || LensDriver::open_with(&port, LensConfig::default())).await;
    let driver = match opened {
        Ok(Ok(driver)) => driver,
        Ok(Err(e)) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
        Err(e) => {
            error!("Session task failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let cancel = driver.cancel_handle();
    let mut task = tokio::task::spawn_blocking(move || driver.scope(demo));

    let finished = tokio::select! {
        joined = &mut task => Some(joined),
        _ = tokio::signal::ctrl_c() => None,
    };
    let joined = match finished {
        Some(joined) => joined,
        None => {
            warn!("Interrupted, closing the lens session");
            cancel.cancel();
            task.await
        }
    };

    match joined {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Session task failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
