// src/main.rs

use dotenv::dotenv;
use std::{env, error::Error, path::PathBuf};
use log::{info, error};
use fakedaq_lib::{
    DaqConfig,   // host, port and instrument constants
    Server,      // one-client-at-a-time accept loop
    SourceSpec,  // synthetic pattern or recorded *.bin file
};

/* RUST_LOG=fakedaq_lib=debug,fakedaq_server=info \
cargo run -p fakedaq-server -- [recording.bin] */

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    // ──────── ① Load .env if present ────────
    if let Err(e) = dotenv() {
        if !e.not_found() {
            return Err(format!("Failed to read .env file: {}", e).into());
        }
    }

    // initialize logger and panic hook
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    std::panic::set_hook(Box::new(|info| {
        error!("Thread panic: {:?}", info);
    }));

    // ──────── ② Instrument config & data source ────────
    let config = DaqConfig::from_env()?;
    let source = match env::args_os().nth(1) {
        Some(path) => SourceSpec::Recording(PathBuf::from(path)),
        None => SourceSpec::Synthetic,
    };

    info!("Initializing fake daqsrv...");
    info!(
        "Instrument: {} channels at {} Hz, data: {:?}",
        config.nchannels, config.sample_rate, source
    );

    // ──────── ③ Serve until interrupted ────────
    let server = Server::bind(config, source).await?;
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }
    Ok(())
}
