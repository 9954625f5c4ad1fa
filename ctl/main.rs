#![forbid(unsafe_code)]

//! `pktline-inspect`: decode a captured pkt-line stream.
//!
//! Reads a file (or stdin), prints one line per packet and, with
//! `--sideband`, demultiplexes response bands and reports the pack header
//! carried on the data band.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use git_gateway::pktline::pack::{data_band, PackHeader};
use git_gateway::pktline::{decode_bytes, demux_sideband, Band, Packet};

#[derive(Debug, Parser)]
#[command(
    name = "pktline-inspect",
    about = "Decode and summarize a pkt-line stream",
    version,
    long_about = None
)]
struct Cli {
    /// Capture to decode; reads stdin when omitted.
    input: Option<PathBuf>,

    /// Treat data packets as sideband-multiplexed response frames.
    #[arg(long)]
    sideband: bool,
}

fn main() -> ExitCode {
    let args = Cli::parse();

    let raw = match read_input(args.input.as_ref()) {
        Ok(raw) => raw,
        Err(err) => {
            eprintln!("Error: cannot read input: {err}");
            return ExitCode::FAILURE;
        }
    };

    let packets = match decode_bytes(&raw) {
        Ok(packets) => packets,
        Err(err) => {
            eprintln!("Error: {err}");
            return ExitCode::FAILURE;
        }
    };

    for (index, packet) in packets.iter().enumerate() {
        println!("{index:>5}  {}", describe(packet, args.sideband));
    }
    println!("{} packet(s), {} byte(s)", packets.len(), raw.len());

    if args.sideband {
        let pack = data_band(&packets);
        match PackHeader::parse(&pack) {
            Ok(header) => println!(
                "pack: version {}, {} entr{}",
                header.version,
                header.entries,
                if header.entries == 1 { "y" } else { "ies" }
            ),
            Err(_) if pack.is_empty() => println!("pack: none"),
            Err(err) => println!("pack: {err}"),
        }
    }

    ExitCode::SUCCESS
}

fn read_input(path: Option<&PathBuf>) -> std::io::Result<Vec<u8>> {
    match path {
        Some(path) => std::fs::read(path),
        None => {
            let mut raw = Vec::new();
            std::io::stdin().read_to_end(&mut raw)?;
            Ok(raw)
        }
    }
}

fn describe(packet: &Packet, sideband: bool) -> String {
    let Packet::Data(payload) = packet else {
        return "flush".to_owned();
    };

    if !sideband {
        return format!("data  {:>5}  {}", payload.len(), preview(payload));
    }

    match demux_sideband(packet) {
        Ok(frame) => match frame.band {
            Band::Data => format!("band1 {:>5}  <{} data bytes>", payload.len(), frame.payload.len()),
            Band::Progress => format!("band2 {:>5}  {}", payload.len(), preview(&frame.payload)),
            Band::Error => format!("band3 {:>5}  {}", payload.len(), preview(&frame.payload)),
        },
        Err(_) => format!("data  {:>5}  {}", payload.len(), preview(payload)),
    }
}

/// Printable rendering of a payload, truncated to one terminal line.
fn preview(payload: &[u8]) -> String {
    const LIMIT: usize = 72;
    let text = String::from_utf8_lossy(payload);
    let escaped = text.trim_end_matches('\n').escape_debug().to_string();
    if escaped.chars().count() > LIMIT {
        let cut: String = escaped.chars().take(LIMIT).collect();
        format!("{cut}…")
    } else {
        escaped
    }
}
