use clap::Parser;
use crocoite::cli::{self, Cli};
use crocoite::error::Error;
use tracing::{error, info};

// one grab is one cooperative event loop; parallel grabs are separate
// processes
#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Cli::parse();
    cli::setup_logging(args.verbose);

    let result = tokio::select! {
        result = cli::run(args) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Err(Error::Internal("interrupted".into()))
        }
    };
    // the grab future is dropped at this point; on the interrupt path the
    // supervisor's drop guard reaps a spawned browser child and removes
    // its profile directory

    let code = match result {
        Ok(()) => 0,
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}
