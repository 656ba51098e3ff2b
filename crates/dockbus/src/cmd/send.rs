use std::time::Duration;

use dockbus_station::{BusClient, BusConfig, CallOptions, ClientConfig, Request};

use crate::cmd::SendArgs;
use crate::exit::{station_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_response, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    if !args.module.is_bus() {
        return Err(CliError::new(
            USAGE,
            format!("--module must name a bus, got {}", args.module),
        ));
    }
    let request = resolve_request(&args)?;

    let defaults = BusConfig::defaults(args.module);
    let config = ClientConfig {
        module: args.module,
        addr: args.connect.clone().unwrap_or(defaults.listen),
        app_name: args.app.clone(),
        device_timeout: Duration::from_millis(u64::from(args.timeout)),
        retries: args.retries,
    };
    let client = BusClient::connect(config).map_err(|err| station_error("connect failed", err))?;

    let opts = if args.no_wait {
        CallOptions::fire_and_forget()
    } else {
        CallOptions::blocking(i64::from(args.timeout))
    };
    let response = client
        .call(args.dev, &request, &opts)
        .map_err(|err| station_error("call failed", err))?;

    print_response(
        args.module,
        &args.dev.to_string(),
        args.msg,
        response.as_ref(),
        format,
    );
    Ok(SUCCESS)
}

fn resolve_request(args: &SendArgs) -> CliResult<Request> {
    let payload = hex::decode(args.payload.trim())
        .map_err(|err| CliError::new(USAGE, format!("--payload is not valid hex: {err}")))?;
    Request::decode(args.msg, &payload)
        .map_err(|err| CliError::new(USAGE, format!("cannot build {} request: {err}", args.msg)))
}
