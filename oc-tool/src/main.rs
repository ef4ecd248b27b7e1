use std::env;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use objcache::{FileStore, HostArch, KvStore, decode_record, describe_record};
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    List { dir: PathBuf, arch: HostArch },
    Show {
        dir: PathBuf,
        arch: HostArch,
        guest_entry: u64,
    },
    Verify { dir: PathBuf, arch: HostArch },
    Help,
    Version,
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let command = match parse_cli_args(&args) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("error: {message}");
            print_usage();
            return ExitCode::from(2);
        }
    };

    match command {
        Command::Help => {
            print_usage();
            ExitCode::SUCCESS
        }
        Command::Version => {
            println!("{}", binary_version_text());
            ExitCode::SUCCESS
        }
        command => {
            init_logging();
            debug!("{}", binary_version_text());
            match run(command) {
                Ok(true) => ExitCode::SUCCESS,
                Ok(false) => ExitCode::FAILURE,
                Err(err) => {
                    error!("{err}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn init_logging() {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .init();
}

/// Returns `Ok(false)` when the command ran but found problems.
fn run(command: Command) -> Result<bool, Box<dyn std::error::Error>> {
    match command {
        Command::List { dir, arch } => {
            let store = FileStore::open_existing(&dir, arch)?;
            println!("# {}", store.config());
            println!("{:<18} {:>6} {:>8} {:>6}", "entry", "ranges", "code", "relocs");
            for guest_entry in store.keys() {
                let Some(bytes) = store.load(guest_entry)? else {
                    continue;
                };
                match decode_record(arch, &bytes) {
                    Ok(record) => println!(
                        "{:<18} {:>6} {:>8} {:>6}",
                        format!("{guest_entry:#x}"),
                        record.ranges.len(),
                        record.fragment.code.len(),
                        record.fragment.relocations.len()
                    ),
                    Err(err) => println!("{:<18} <invalid: {err}>", format!("{guest_entry:#x}")),
                }
            }
            Ok(true)
        }
        Command::Show {
            dir,
            arch,
            guest_entry,
        } => {
            let store = FileStore::open_existing(&dir, arch)?;
            let bytes = store
                .load(guest_entry)?
                .ok_or_else(|| io::Error::other(format!("no entry {guest_entry:#x}")))?;
            let record = decode_record(arch, &bytes)?;
            print!("{}", describe_record(arch, guest_entry, &record));
            Ok(true)
        }
        Command::Verify { dir, arch } => {
            let store = FileStore::open_existing(&dir, arch)?;
            let mut failures = 0usize;
            let keys = store.keys();
            for guest_entry in &keys {
                let result = store
                    .load(*guest_entry)
                    .map_err(|err| err.to_string())
                    .and_then(|bytes| {
                        let bytes = bytes.ok_or_else(|| "missing payload".to_string())?;
                        decode_record(arch, &bytes).map_err(|err| err.to_string())
                    });
                if let Err(err) = result {
                    failures += 1;
                    println!("{guest_entry:#x}: {err}");
                }
            }
            println!(
                "{}: {} entries, {failures} invalid, config [{}]",
                store.index_path().display(),
                keys.len(),
                store.config()
            );
            Ok(failures == 0)
        }
        Command::Help | Command::Version => Ok(true),
    }
}

fn parse_cli_args(args: &[String]) -> Result<Command, String> {
    let mut positional = Vec::new();
    let mut arch = HostArch::native().unwrap_or(HostArch::X86_64);
    let mut index = 0usize;
    while index < args.len() {
        match args[index].as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-V" | "--version" => return Ok(Command::Version),
            "--arch" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --arch".to_string())?;
                arch = HostArch::from_name(raw).ok_or_else(|| format!("unknown arch '{raw}'"))?;
                index += 2;
            }
            flag if flag.starts_with('-') => return Err(format!("unknown option '{flag}'")),
            value => {
                positional.push(value.to_string());
                index += 1;
            }
        }
    }

    let Some((command, rest)) = positional.split_first() else {
        return Ok(Command::Help);
    };
    match (command.as_str(), rest) {
        ("list", [dir]) => Ok(Command::List {
            dir: PathBuf::from(dir),
            arch,
        }),
        ("show", [dir, entry]) => Ok(Command::Show {
            dir: PathBuf::from(dir),
            arch,
            guest_entry: parse_address(entry)?,
        }),
        ("verify", [dir]) => Ok(Command::Verify {
            dir: PathBuf::from(dir),
            arch,
        }),
        ("list" | "show" | "verify", _) => Err(format!("wrong arguments for '{command}'")),
        (other, _) => Err(format!("unknown command '{other}'")),
    }
}

fn parse_address(raw: &str) -> Result<u64, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse::<u64>(),
    };
    parsed.map_err(|_| format!("invalid guest address '{raw}'"))
}

fn print_usage() {
    println!("Usage:");
    println!("  oc-tool list <cache_dir> [--arch <x86_64|aarch64>]");
    println!("  oc-tool show <cache_dir> <guest_entry> [--arch <x86_64|aarch64>]");
    println!("  oc-tool verify <cache_dir> [--arch <x86_64|aarch64>]");
    println!("  oc-tool -V|--version");
}

fn binary_version_text() -> String {
    format!(
        "{} {} (cache format v{}, cookies {}/{})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        cache_abi::FORMAT_VERSION,
        String::from_utf8_lossy(&cache_abi::INDEX_COOKIE_TAG),
        String::from_utf8_lossy(&cache_abi::DATA_COOKIE_TAG),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn parses_commands_and_arch() {
        assert_eq!(
            parse_cli_args(&args(&["show", "/tmp/oc", "0x400000", "--arch", "aarch64"])),
            Ok(Command::Show {
                dir: PathBuf::from("/tmp/oc"),
                arch: HostArch::Aarch64,
                guest_entry: 0x400000,
            })
        );
        assert_eq!(
            parse_cli_args(&args(&["--arch", "x86_64", "verify", "cache"])),
            Ok(Command::Verify {
                dir: PathBuf::from("cache"),
                arch: HostArch::X86_64,
            })
        );
        assert_eq!(parse_cli_args(&args(&[])), Ok(Command::Help));
        assert_eq!(parse_cli_args(&args(&["-V"])), Ok(Command::Version));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_cli_args(&args(&["list"])).is_err());
        assert!(parse_cli_args(&args(&["frobnicate", "x"])).is_err());
        assert!(parse_cli_args(&args(&["list", "x", "--arch", "mips"])).is_err());
        assert!(parse_cli_args(&args(&["show", "x", "entry"])).is_err());
        assert!(parse_cli_args(&args(&["list", "x", "--bogus"])).is_err());
    }

    #[test]
    fn version_reports_cache_format() {
        let text = binary_version_text();
        assert!(text.starts_with("oc-tool "), "{text}");
        assert!(
            text.contains(&format!("cache format v{}", cache_abi::FORMAT_VERSION)),
            "{text}"
        );
        assert!(text.contains("OCXI/OCXD"), "{text}");
    }

    #[test]
    fn addresses_accept_hex_and_decimal() {
        assert_eq!(parse_address("0x10"), Ok(16));
        assert_eq!(parse_address("16"), Ok(16));
        assert!(parse_address("0xZZ").is_err());
    }
}
