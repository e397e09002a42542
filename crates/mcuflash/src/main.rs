use clap::{Args, Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::*;
use mcuflash_core::{
    section::{parse_includes, parse_int},
    uf2::parse_family_id,
    usb::BusAddr,
    Include, Target,
};

use std::{
    io::{self, Write},
    path::PathBuf,
    process,
};

use crate::{
    convert::{convert, Format},
    load::load,
};

mod convert;
mod load;
mod reporter;

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the program as a raw binary image
    Bin {
        #[command(flatten)]
        image: ImageArgs,

        /// Input ELF file, <current directory name>.elf by default
        input: Option<PathBuf>,

        /// Output file, the input with a .bin extension by default
        output: Option<PathBuf>,
    },
    /// Write the program as Intel HEX
    Hex {
        /// Raw files to include, BIN1:ADDR1,BIN2:ADDR2,...
        #[clap(long, value_parser = include_list_parser)]
        inc: Option<IncludeList>,

        /// Input ELF file, <current directory name>.elf by default
        input: Option<PathBuf>,

        /// Output file, the input with a .hex extension by default
        output: Option<PathBuf>,
    },
    /// Write the program as a UF2 file
    Uf2 {
        #[command(flatten)]
        image: ImageArgs,

        /// UF2 family, by name (rp2040, rp2350_arm_s, etc.) or number
        #[clap(long, value_parser = family_parser)]
        family: u32,

        /// Input ELF file, <current directory name>.elf by default
        input: Option<PathBuf>,

        /// Output file, the input with a .uf2 extension by default
        output: Option<PathBuf>,
    },
    /// Load the program onto a device in bootloader mode
    Load {
        #[command(flatten)]
        image: ImageArgs,

        /// Target device and transport
        #[clap(long, value_enum, default_value_t = TargetArg::Auto)]
        target: TargetArg,

        /// Use the device at this USB location, BUS:ADDR in decimal
        #[clap(long, value_parser = bus_addr_parser)]
        usb: Option<BusAddr>,

        /// Don't show progress
        #[clap(short, long)]
        quiet: bool,

        /// Input ELF file, <current directory name>.elf by default
        input: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct ImageArgs {
    /// Raw files to include, BIN1:ADDR1,BIN2:ADDR2,...
    #[clap(long, value_parser = include_list_parser)]
    inc: Option<IncludeList>,

    /// Byte used to fill gaps between sections
    #[clap(long, value_parser = pad_parser, default_value = "0xff")]
    pad: u8,
}

#[derive(Clone, Debug, Default)]
struct IncludeList(Vec<Include>);

fn include_list_parser(s: &str) -> Result<IncludeList, String> {
    parse_includes(s).map(IncludeList).map_err(|e| e.to_string())
}

fn pad_parser(s: &str) -> Result<u8, String> {
    parse_int(s)
        .and_then(|v| u8::try_from(v).ok())
        .ok_or_else(|| format!("Bad pad byte '{}'", s))
}

fn family_parser(s: &str) -> Result<u32, String> {
    parse_family_id(s).map_err(|e| e.to_string())
}

fn bus_addr_parser(s: &str) -> Result<BusAddr, String> {
    s.parse().map_err(|e: mcuflash_core::usb::DiscoveryError| e.to_string())
}

#[derive(Copy, Clone, Debug, Default, ValueEnum)]
enum TargetArg {
    /// Determine the target from the ELF file
    #[default]
    Auto,
    /// RP2350 (Raspberry Pi Pico 2) via USB PICOBOOT
    Pico,
    /// Teensy 4.x via the HID bootloader
    Teensy,
    /// STM32 via the USB DFU bootloader
    Stm32,
}

impl From<TargetArg> for Option<Target> {
    fn from(target: TargetArg) -> Self {
        match target {
            TargetArg::Auto => None,
            TargetArg::Pico => Some(Target::Pico),
            TargetArg::Teensy => Some(Target::Teensy),
            TargetArg::Stm32 => Some(Target::Stm32),
        }
    }
}

#[derive(Parser, Debug, Default)]
#[clap(version, about, long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Set the logging verbosity
    #[clap(short, long, value_enum, global = true, default_value_t = LogLevel::Info)]
    verbose: LogLevel,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Copy, Clone, Debug, Default, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Off => LevelFilter::Off,
        }
    }
}

fn run(command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Bin {
            image,
            input,
            output,
        } => convert(
            Format::Bin,
            input,
            output,
            &image.inc.unwrap_or_default().0,
            image.pad,
        ),
        Command::Hex { inc, input, output } => convert(
            Format::Hex,
            input,
            output,
            &inc.unwrap_or_default().0,
            mcuflash_core::DEFAULT_PAD,
        ),
        Command::Uf2 {
            image,
            family,
            input,
            output,
        } => convert(
            Format::Uf2 { family_id: family },
            input,
            output,
            &image.inc.unwrap_or_default().0,
            image.pad,
        ),
        Command::Load {
            image,
            target,
            usb,
            quiet,
            input,
        } => load(
            input,
            &image.inc.unwrap_or_default().0,
            image.pad,
            target.into(),
            usb,
            quiet,
        ),
    }
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(Env::default())
        .filter_level(cli.verbose.into())
        .target(env_logger::Target::Stdout)
        .format(|buf, record| {
            let level = record.level();
            if level == Level::Info {
                writeln!(buf, "{}", record.args())
            } else {
                writeln!(buf, "{}: {}", record.level(), record.args())
            }
        })
        .init();

    let command = match cli.command {
        Some(command) => command,
        None => return,
    };

    process::exit(exit_status(run(command), io::stderr().lock()));
}

/// Reports a failed run on one line, whatever the log level, and gives the
/// process exit status.
fn exit_status(result: Result<(), Box<dyn std::error::Error>>, mut stderr: impl Write) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => {
            let _ = writeln!(stderr, "error: {err}");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_load_options() {
        let cli = Cli::try_parse_from([
            "mcuflash",
            "load",
            "--target",
            "stm32",
            "--usb",
            "1:7",
            "--pad",
            "0",
            "-q",
            "fw.elf",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Load {
                image,
                target,
                usb,
                quiet,
                input,
            }) => {
                assert_eq!(Option::<Target>::from(target), Some(Target::Stm32));
                assert_eq!(usb, Some(BusAddr { bus: 1, address: 7 }));
                assert_eq!(image.pad, 0);
                assert!(quiet);
                assert_eq!(input, Some(PathBuf::from("fw.elf")));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_uf2_family_and_includes() {
        let cli = Cli::try_parse_from([
            "mcuflash",
            "uf2",
            "--family",
            "rp2350_arm_s",
            "--inc",
            "boot.bin:0x10000000,extra.bin:4096",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Uf2 { image, family, .. }) => {
                assert_eq!(family, 0xe48b_ff59);
                assert_eq!(image.pad, 0xff);
                let inc = image.inc.unwrap_or_default().0;
                assert_eq!(inc.len(), 2);
                assert_eq!(inc[1].paddr, 4096);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn failures_exit_with_one_line_on_stderr() {
        log::set_max_level(LevelFilter::Off);
        let command = Command::Bin {
            image: ImageArgs { inc: None, pad: 0xff },
            input: Some(PathBuf::from("no-such-program.elf")),
            output: Some(std::env::temp_dir().join("no-such-program.bin")),
        };

        let mut stderr = Vec::new();
        assert_eq!(exit_status(run(command), &mut stderr), 1);
        let text = String::from_utf8(stderr).unwrap();
        assert!(text.starts_with("error: "), "{text}");
        assert_eq!(text.lines().count(), 1);

        let mut stderr = Vec::new();
        assert_eq!(exit_status(Ok(()), &mut stderr), 0);
        assert!(stderr.is_empty());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(Cli::try_parse_from(["mcuflash", "uf2", "--family", "nope"]).is_err());
        assert!(Cli::try_parse_from(["mcuflash", "bin", "--pad", "256"]).is_err());
        assert!(Cli::try_parse_from(["mcuflash", "load", "--usb", "1-7"]).is_err());
        assert!(Cli::try_parse_from(["mcuflash", "load", "--target", "esp32"]).is_err());
    }
}
