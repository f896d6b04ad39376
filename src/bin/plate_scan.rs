use clap::Parser;
use plate_scan::{cli::Cli, init_logging, plate_scan_service};
use tracing::{error, info};

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let _guard = init_logging(args.log_level, args.log_path.clone())?;
    info!(
        port = args.port,
        detector_model = %args.detector_model,
        recognizer_model = %args.recognizer_model,
        dictionary = %args.recognizer_dictionary(),
        "Starting plate-scan {}",
        env!("CARGO_PKG_VERSION")
    );

    // Run the tokio runtime on the main thread
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let (plate_scan_future, cancellation_token) = plate_scan_service(args)?;

    rt.spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(?err, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Ctrl+C received, shutting down server");
        cancellation_token.cancel();
    });

    if let Err(err) = rt.block_on(plate_scan_future) {
        error!("Service failed: {err:#}");
        return Err(err);
    }
    info!("Server shut down");
    Ok(())
}
