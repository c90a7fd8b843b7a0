// src/main.rs

use parmerge::{cli, logging, run};

#[tokio::main]
async fn main() {
    match run_main().await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("parmerge error: {err:?}");
            std::process::exit(1);
        }
    }
}

/// Returns `Ok(false)` when the run finished but some targets failed.
async fn run_main() -> anyhow::Result<bool> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    let summary = run(args).await?;
    Ok(summary.is_success())
}
