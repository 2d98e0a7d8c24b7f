use std::io::Result;

use clap::{App, Arg};
use env_logger::Builder;
use log::{debug, info, LevelFilter};

use northd::db::nb::NbDb;
use northd::db::sb::SbDb;
use northd::db::{AdvisoryLock, Store};
use northd::{api, Daemon, DaemonConfig, LOCK_NAME};

fn main() -> Result<()> {
    let matches = App::new("northd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Virtual-network control-plane translator")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config-path")
                .help("Path to daemon config file")
                .takes_value(true),
        )
        .arg(
            Arg::new("ovnnb-db")
                .long("ovnnb-db")
                .help("Northbound database location")
                .takes_value(true),
        )
        .arg(
            Arg::new("ovnsb-db")
                .long("ovnsb-db")
                .help("Southbound database location")
                .takes_value(true),
        )
        .arg(
            Arg::new("unixctl")
                .long("unixctl")
                .help("Control API address")
                .takes_value(true),
        )
        .arg(
            Arg::new("paused")
                .long("paused")
                .help("Start in the paused (standby) state"),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .multiple_occurrences(true)
                .help("Sets the level of logging verbosity"),
        )
        .get_matches();

    let (northd_level, other_level) = match matches.occurrences_of("v") {
        0 => (LevelFilter::Info, LevelFilter::Warn),
        1 => (LevelFilter::Debug, LevelFilter::Warn),
        2 => (LevelFilter::Trace, LevelFilter::Warn),
        _ => (LevelFilter::Trace, LevelFilter::Trace),
    };
    Builder::new()
        .filter(Some("northd"), northd_level)
        .filter(None, other_level)
        .init();
    info!("Logging at levels {}/{}", northd_level, other_level);

    let mut config = match matches.value_of("config") {
        Some(path) => DaemonConfig::from_file(path)?,
        None => DaemonConfig::default(),
    };
    if let Some(nb) = matches.value_of("ovnnb-db") {
        config.ovnnb_db = nb.to_string();
    }
    if let Some(sb) = matches.value_of("ovnsb-db") {
        config.ovnsb_db = sb.to_string();
    }
    if let Some(unixctl) = matches.value_of("unixctl") {
        config.unixctl = unixctl
            .parse()
            .expect("Must specify a valid unixctl address");
    }
    if matches.is_present("paused") {
        config.start_paused = true;
    }
    debug!(
        "Using databases nb={} sb={}",
        config.ovnnb_db, config.ovnsb_db
    );

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let nb = Store::new(NbDb::default());
        let sb = Store::new(SbDb::default());
        let lock = AdvisoryLock::new(LOCK_NAME);
        let daemon = Daemon::new(config.clone(), nb, sb, lock);
        let control = daemon.control();
        let server = match api::serve(config.unixctl, control).await {
            Ok(server) => server,
            Err(err) => {
                log::error!("control API failed to start: {}", err);
                return;
            }
        };
        daemon.run().await;
        let _ = server.stop();
    });
    Ok(())
}
