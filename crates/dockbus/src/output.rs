use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use dockbus_station::{CallbackEvent, DeviceRecord, DeviceStats, MessageId, Module, Response};
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct ResponseOutput<'a> {
    module: Module,
    dev: String,
    msg: &'a str,
    fields: Map<String, Value>,
}

/// Print the decoded answer to one call. `None` means nothing was awaited.
pub fn print_response(
    module: Module,
    dev: &str,
    msg_id: MessageId,
    response: Option<&Response>,
    format: OutputFormat,
) {
    let fields = response.map(Response::fields).unwrap_or_default();
    match format {
        OutputFormat::Json => {
            let out = ResponseOutput {
                module,
                dev: dev.to_string(),
                msg: msg_id.name(),
                fields: fields
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), Value::String(v.clone())))
                    .collect(),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = new_table(vec!["FIELD", "VALUE"]);
            table.add_row(vec!["module".to_string(), module.to_string()]);
            table.add_row(vec!["dev".to_string(), dev.to_string()]);
            table.add_row(vec!["msg".to_string(), msg_id.name().to_string()]);
            for (key, value) in &fields {
                table.add_row(vec![(*key).to_string(), value.clone()]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let rendered: Vec<String> = fields.iter().map(|(k, v)| format!("{k}={v}")).collect();
            if rendered.is_empty() {
                println!("{module} dev={dev} {msg_id}: sent");
            } else {
                println!("{module} dev={dev} {msg_id}: {}", rendered.join(" "));
            }
        }
    }
}

pub fn print_event(event: &CallbackEvent, format: OutputFormat) {
    let msg = msg_name(event.msg_id);
    match format {
        OutputFormat::Json => print_json(event),
        OutputFormat::Table => {
            let mut table = new_table(vec!["MODULE", "DEV", "MSG", "STATUS", "PAYLOAD"]);
            table.add_row(vec![
                event.module.to_string(),
                event.dev_num.to_string(),
                msg,
                event.status.to_string(),
                hex::encode(&event.payload),
            ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "{} dev={} msg={} status={} payload={}",
                event.module,
                event.dev_num,
                msg,
                event.status,
                hex::encode(&event.payload)
            );
        }
    }
}

/// One row of the device summary.
#[derive(Debug, Serialize)]
pub struct DeviceRow {
    pub dev: u16,
    pub module: Module,
    pub addr: String,
    #[serde(flatten)]
    pub stats: DeviceStats,
}

impl From<&DeviceRecord> for DeviceRow {
    fn from(record: &DeviceRecord) -> Self {
        Self {
            dev: record.index(),
            module: record.bus(),
            addr: record.addr().to_string(),
            stats: record.stats(),
        }
    }
}

pub fn print_devices(rows: &[DeviceRow], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&rows),
        OutputFormat::Table => {
            let mut table = new_table(vec!["DEV", "MODULE", "ADDR", "TX", "RX", "LEN MISMATCH"]);
            for row in rows {
                table.add_row(vec![
                    row.dev.to_string(),
                    row.module.to_string(),
                    row.addr.clone(),
                    row.stats.tx_frames.to_string(),
                    row.stats.rx_frames.to_string(),
                    row.stats.length_mismatches.to_string(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            if rows.is_empty() {
                println!("no devices discovered");
            }
            for row in rows {
                println!(
                    "dev={} module={} addr={} tx={} rx={}",
                    row.dev, row.module, row.addr, row.stats.tx_frames, row.stats.rx_frames
                );
            }
        }
    }
}

fn msg_name(msg_id: u8) -> String {
    MessageId::try_from(msg_id)
        .map(|id| id.name().to_string())
        .unwrap_or_else(|_| format!("{msg_id:#04x}"))
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

fn print_json(value: &impl Serialize) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}
