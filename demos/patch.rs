use std::fs;

use clap::{arg, command};
use log::LevelFilter;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use kport::{patch_module, Arch, SymbolDirectory};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = command!()
        .arg(arg!(-k --kernel <FILE> "raw (decompressed) kernel image").required(true))
        .arg(arg!(-m --module <FILE> "prebuilt module to patch").required(true))
        .arg(arg!(-s --symbols <FILE> "kallsyms-style symbol map").required(true))
        .arg(arg!(-o --output <FILE> "where to write the patched module").required(true))
        .arg(arg!(-a --arch <ARCH> "target architecture").default_value("aarch64"))
        .arg(arg!(-v --verbose ... "increase log verbosity"))
        .get_matches();

    let level = match matches.get_count("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .unwrap();

    let arch = match matches.get_one::<String>("arch").unwrap().as_str() {
        "aarch64" | "arm64" => Arch::Aarch64,
        "x86_64" => Arch::X86_64,
        other => return Err(format!("unknown architecture {}", other).into()),
    };

    let kernel = fs::read(matches.get_one::<String>("kernel").unwrap())?;
    let module = fs::read(matches.get_one::<String>("module").unwrap())?;
    let symbols = fs::read_to_string(matches.get_one::<String>("symbols").unwrap())?;
    let dir = parse_symbol_map(&symbols);

    let (patched, report) = patch_module(arch, kernel, &dir, module)?;
    fs::write(matches.get_one::<String>("output").unwrap(), patched)?;

    println!("patched module written as {}", report.module_name);
    if !report.missing.is_empty() {
        println!("unresolved checksums: {}", report.missing.join(", "));
    }

    Ok(())
}

/// Parses `address type name` lines, the `/proc/kallsyms` format.
fn parse_symbol_map(text: &str) -> SymbolDirectory {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let addr = u64::from_str_radix(parts.next()?, 16).ok()?;
            let _kind = parts.next()?;
            let name = parts.next()?;
            Some((name.to_owned(), addr))
        })
        .collect()
}
