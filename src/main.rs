use std::process::ExitCode;

use tracing::{error, info};

use keepsake::{persist, KindRegistry, Result, Settings, Store};

// Opens the configured store, checks that every log still replays to its
// record and reports what is in it.
fn run() -> Result<()> {
    let file = std::env::args().nth(1);
    let settings = Settings::load(file.as_deref())?;
    keepsake::telemetry::init(&settings.log_filter)?;
    let mode = settings.persistence_mode();
    info!(?mode, scale = settings.decimal_scale, actor = %settings.actor, "starting keepsake");

    let persistor = persist::open(&mode)?;
    let store = Store::open(settings.store_config(), KindRegistry::financial(), persistor)?;
    let verified = store.verify()?;
    info!(entities = verified, "every entity log replays to its record");
    for (kind, count) in store.census()? {
        info!(kind = %kind, count, "live entities");
    }
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "keepsake failed");
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
