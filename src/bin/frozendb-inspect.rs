//! CLI inspector (§6.3): reads a database file directly and prints every row
//! as TSV. Reads the raw file rather than going through `Db`/`FileManager` so
//! it never contends for the write lock and can inspect a file mid-write.

use std::collections::HashMap;
use std::io::Read as _;
use std::process::ExitCode;

use clap::Parser;
use frozendb::codec::{self, EndControl, RowUnion};
use frozendb::header::Header;
use frozendb::key;

#[derive(Parser)]
#[command(name = "frozendb-inspect", about = "Dump the rows of a frozenDB file as TSV")]
struct Cli {
    #[arg(long)]
    path: std::path::PathBuf,

    #[arg(long, default_value_t = 0)]
    offset: u64,

    /// -1 means no limit.
    #[arg(long, default_value_t = -1)]
    limit: i64,

    #[arg(long, default_value_t = true)]
    print_header: bool,
}

struct RowLine {
    index: u64,
    kind: &'static str,
    key: String,
    value: String,
    savepoint: String,
    tx_start: String,
    tx_end: String,
    rollback: String,
    parity: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "frozendb=info".to_string()),
        ))
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(failed) => {
            if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            eprintln!("frozendb-inspect: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> frozendb::error::Result<bool> {
    let mut file = std::fs::File::open(&cli.path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    let header = Header::from_bytes(&bytes[..frozendb::config::HEADER_SIZE as usize])?;
    let row_size = header.row_size as u64;
    let body = &bytes[frozendb::config::HEADER_SIZE as usize..];

    let mut lines = Vec::new();
    let mut any_failed = false;
    let mut tx_start_of: HashMap<u64, u64> = HashMap::new();
    let mut current_tx_start: Option<u64> = None;

    let mut physical = 0u64;
    let mut cursor = 0usize;
    while cursor < body.len() {
        let remaining = body.len() - cursor;
        if (remaining as u64) < row_size {
            lines.push(RowLine {
                index: physical,
                kind: "Partial",
                key: String::new(),
                value: String::new(),
                savepoint: String::new(),
                tx_start: String::new(),
                tx_end: String::new(),
                rollback: String::new(),
                parity: String::new(),
            });
            break;
        }

        let chunk = &body[cursor..cursor + row_size as usize];
        match codec::unmarshal_row(chunk, row_size as usize) {
            Ok(RowUnion::Checksum(c)) => {
                lines.push(RowLine {
                    index: physical,
                    kind: "Checksum",
                    key: String::new(),
                    value: format!("{:08x}", c.crc),
                    savepoint: String::new(),
                    tx_start: String::new(),
                    tx_end: String::new(),
                    rollback: String::new(),
                    parity: "ok".to_string(),
                });
            }
            Ok(RowUnion::Null(n)) => {
                let sentinel = key::null_sentinel_key(n.max_timestamp);
                lines.push(RowLine {
                    index: physical,
                    kind: "Null",
                    key: key::encode_key(&sentinel),
                    value: String::new(),
                    savepoint: String::new(),
                    tx_start: physical.to_string(),
                    tx_end: physical.to_string(),
                    rollback: String::new(),
                    parity: "ok".to_string(),
                });
                current_tx_start = None;
            }
            Ok(RowUnion::Data(d)) => {
                let tx_start = if d.first_in_transaction {
                    current_tx_start = Some(physical);
                    physical
                } else {
                    current_tx_start.unwrap_or(physical)
                };
                tx_start_of.insert(physical, tx_start);

                let (rollback, savepoint) = match d.end_control.as_rollback() {
                    Some((k, sp)) => (k.to_string(), sp),
                    None => (String::new(), matches!(d.end_control, EndControl::SavepointCommit | EndControl::SavepointContinue)),
                };
                let tx_end = if d.end_control.is_terminal() {
                    current_tx_start = None;
                    physical.to_string()
                } else {
                    String::new()
                };

                lines.push(RowLine {
                    index: physical,
                    kind: "Data",
                    key: key::encode_key(&d.key),
                    value: String::from_utf8_lossy(&d.value).to_string(),
                    savepoint: savepoint.to_string(),
                    tx_start: tx_start.to_string(),
                    tx_end,
                    rollback,
                    parity: "ok".to_string(),
                });
            }
            Ok(RowUnion::Partial(_)) => unreachable!("fixed-size chunk can't be partial"),
            Err(e) => {
                any_failed = true;
                lines.push(RowLine {
                    index: physical,
                    kind: "Error",
                    key: String::new(),
                    value: e.to_string(),
                    savepoint: String::new(),
                    tx_start: String::new(),
                    tx_end: String::new(),
                    rollback: String::new(),
                    parity: "bad".to_string(),
                });
            }
        }

        cursor += row_size as usize;
        physical += 1;
    }

    // Backfill tx_end for continuation rows whose terminal row came later in the scan.
    let mut tx_end_of: HashMap<u64, u64> = HashMap::new();
    for line in &lines {
        if line.kind == "Data" && !line.tx_end.is_empty() {
            if let Some(&start) = tx_start_of.get(&line.index) {
                tx_end_of.insert(start, line.index);
            }
        }
    }
    for line in &mut lines {
        if line.kind == "Data" && line.tx_end.is_empty() {
            if let Some(&start) = tx_start_of.get(&line.index) {
                if let Some(end) = tx_end_of.get(&start) {
                    line.tx_end = end.to_string();
                }
            }
        }
    }

    if cli.print_header {
        println!("index\ttype\tkey\tvalue\tsavepoint\ttx_start\ttx_end\trollback\tparity");
    }

    let limit = if cli.limit < 0 { usize::MAX } else { cli.limit as usize };
    for line in lines.iter().skip(cli.offset as usize).take(limit) {
        println!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            line.index, line.kind, line.key, line.value, line.savepoint, line.tx_start, line.tx_end, line.rollback, line.parity
        );
    }

    Ok(any_failed)
}
