use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dockbus_station::{CallbackListener, StationError};

use crate::cmd::{install_ctrlc_handler, ListenArgs};
use crate::exit::{station_error, CliResult, SUCCESS};
use crate::output::{print_event, OutputFormat};

const READ_INTERVAL: Duration = Duration::from_millis(200);

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let mut listener = CallbackListener::connect(&args.connect, &args.app)
        .map_err(|err| station_error("connect failed", err))?;
    listener
        .set_read_timeout(Some(READ_INTERVAL))
        .map_err(|err| station_error("connect failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut printed = 0usize;

    while running.load(Ordering::SeqCst) {
        let event = match listener.recv() {
            Ok(event) => event,
            Err(StationError::Frame(err)) if err.is_timeout() => continue,
            Err(StationError::SockDisc) => break,
            Err(err) => return Err(station_error("receive failed", err)),
        };

        if let Some(module) = args.module {
            if event.module != module {
                continue;
            }
        }

        print_event(&event, format);
        printed = printed.saturating_add(1);

        if let Some(count) = args.count {
            if printed >= count {
                return Ok(SUCCESS);
            }
        }
    }

    Ok(SUCCESS)
}
