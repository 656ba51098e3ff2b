use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dockbus_station::{
    scan, BusClient, BusConfig, BusProbe, BusServer, CallbackPublisher, CallbackServer,
    ClientConfig, ScanConfig, Station, StationConfig, StationError, DAEMON_APP_NAME,
};
use tracing::{error, info, warn};

use crate::cmd::{install_ctrlc_handler, ServeArgs};
use crate::exit::{station_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_devices, DeviceRow, OutputFormat};

const WATCH_INTERVAL: Duration = Duration::from_millis(50);

type Worker = (String, JoinHandle<dockbus_station::Result<()>>);

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let config = load_config(&args)?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let station = Arc::new(Station::new());
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut workers: Vec<Worker> = Vec::new();

    if let Err(err) = start(&config, &station, &shutdown, &mut workers) {
        shutdown.store(true, Ordering::SeqCst);
        join_all(workers);
        return Err(err);
    }
    info!(workers = workers.len(), "station running, press Ctrl-C to stop");

    while running.load(Ordering::SeqCst) {
        if let Some((name, _)) = workers.iter().find(|(_, handle)| handle.is_finished()) {
            warn!(worker = %name, "worker exited, shutting down");
            break;
        }
        thread::sleep(WATCH_INTERVAL);
    }
    shutdown.store(true, Ordering::SeqCst);
    let outcome = join_all(workers);

    let rows: Vec<DeviceRow> = station.table().records().map(DeviceRow::from).collect();
    print_devices(&rows, format);

    outcome.map(|()| SUCCESS)
}

fn load_config(args: &ServeArgs) -> CliResult<StationConfig> {
    let mut config = match &args.config {
        Some(path) => StationConfig::load(path).map_err(|err| {
            station_error(&format!("failed loading {}", path.display()), err)
        })?,
        None => StationConfig::default(),
    };
    for bus in [&mut config.bdp, &mut config.kr] {
        bus.loopback |= args.loopback;
        bus.scan_on_start &= !args.no_scan;
    }
    Ok(config)
}

fn start(
    config: &StationConfig,
    station: &Arc<Station>,
    shutdown: &Arc<AtomicBool>,
    workers: &mut Vec<Worker>,
) -> CliResult<()> {
    let publisher = if config.callback.enabled {
        let (publisher, events) = CallbackPublisher::channel();
        let server = CallbackServer::bind(&config.callback.listen, events, shutdown.clone())
            .map_err(|err| station_error("callback endpoint failed", err))?;
        let handle = server
            .spawn()
            .map_err(|err| station_error("callback endpoint failed", err))?;
        workers.push(("callback".to_string(), handle));
        publisher
    } else {
        CallbackPublisher::disabled()
    };

    station.flush();

    for bus in config.buses().filter(|bus| bus.enabled) {
        let context = format!("{} bus failed", bus.module);
        let server = BusServer::open(
            bus.clone(),
            station.clone(),
            publisher.clone(),
            shutdown.clone(),
        )
        .map_err(|err| station_error(&context, err))?;
        let endpoint = server.local_addr().to_string();
        let handle = server.spawn().map_err(|err| station_error(&context, err))?;
        workers.push((bus.module.to_string(), handle));

        if bus.scan_on_start {
            spawn_scan(bus, endpoint, station.clone(), config.scan.clone())
                .map_err(|err| station_error(&context, err))?;
        }
    }
    Ok(())
}

/// Discovery runs detached: a bus server stopping ends it with an error.
fn spawn_scan(
    bus: &BusConfig,
    endpoint: String,
    station: Arc<Station>,
    scan_config: ScanConfig,
) -> dockbus_station::Result<()> {
    let client_config = ClientConfig {
        addr: endpoint,
        ..ClientConfig::for_bus(bus, DAEMON_APP_NAME)
    };
    let module = bus.module;
    thread::Builder::new()
        .name(format!("dockbus-scan-{module}"))
        .spawn(move || {
            let result = BusClient::connect(client_config)
                .and_then(|client| scan(&BusProbe::new(client, station), &scan_config));
            match result {
                Ok(outcome) => info!(
                    bus = %module,
                    rounds = outcome.rounds,
                    devices = outcome.discovered,
                    converged = outcome.converged,
                    "discovery finished"
                ),
                Err(err) => warn!(bus = %module, error = %err, "discovery aborted"),
            }
        })
        .map(|_| ())
        .map_err(StationError::Io)
}

fn join_all(workers: Vec<Worker>) -> CliResult<()> {
    let mut first_err = None;
    for (name, handle) in workers {
        let err = match handle.join() {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => station_error(&format!("{name} worker failed"), err),
            Err(_) => CliError::new(INTERNAL, format!("{name} worker panicked")),
        };
        error!(worker = %name, error = %err, "worker failed");
        first_err.get_or_insert(err);
    }
    first_err.map_or(Ok(()), Err)
}
