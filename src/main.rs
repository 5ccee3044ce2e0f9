use tracing_subscriber::EnvFilter;

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = crossway::run() {
        tracing::error!(error = ?err, "fatal");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
