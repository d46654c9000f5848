use clap::Parser;

use fleet_automation_controller::cli::{App, Args};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let app = match App::initialize(&args).await {
        Ok(app) => app,
        Err(e) => {
            eprintln!("initialization failed: {e}");
            std::process::exit(1);
        }
    };

    if let Some(name) = &args.run {
        if let Err(e) = app.run_specific(name).await {
            tracing::error!(error = %e, script = %name, "--run failed");
        }
    }

    if let Err(e) = app.start().await {
        eprintln!("scheduler failed to start: {e}");
        std::process::exit(1);
    }

    if let Err(e) = app.repl().await {
        tracing::error!(error = %e, "interactive shell exited with an error");
    }

    app.shutdown().await;
}
