use std::{
    env,
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use log::{debug, info, LevelFilter};
use mcuflash_core::{
    build_image, elf2bin, elf2hex,
    uf2::{write_uf2, UF2_BLOCK_SIZE, UF2_PAYLOAD_SIZE},
    Include,
};
use thiserror::Error;

use crate::reporter::ProgressBarWriter;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("cannot name the default input after the current directory")]
    NoDefaultInput,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Format {
    Bin,
    Hex,
    Uf2 { family_id: u32 },
}

impl Format {
    pub fn extension(self) -> &'static str {
        match self {
            Format::Bin => "bin",
            Format::Hex => "hex",
            Format::Uf2 { .. } => "uf2",
        }
    }
}

/// `<current directory name>.elf`, the input when none is given.
pub fn default_input() -> Result<PathBuf, CliError> {
    let cwd = env::current_dir().map_err(|_| CliError::NoDefaultInput)?;
    let name = cwd.file_name().ok_or(CliError::NoDefaultInput)?;
    Ok(PathBuf::from(name).with_extension("elf"))
}

pub fn default_output(input: &Path, format: Format) -> PathBuf {
    input.with_extension(format.extension())
}

pub fn convert(
    format: Format,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    includes: &[Include],
    pad: u8,
) -> Result<(), Box<dyn std::error::Error>> {
    let input_path = match input {
        Some(path) => path,
        None => default_input()?,
    };
    let output_path = output.unwrap_or_else(|| default_output(&input_path, format));
    debug!(
        "Converting {} to {}",
        input_path.display(),
        output_path.display()
    );

    let input = BufReader::new(File::open(&input_path)?);
    let output = File::create(&output_path)?;

    if let Err(err) = write_output(format, input, output, includes, pad) {
        fs::remove_file(&output_path)?;
        return Err(err);
    }

    info!("Wrote {}", output_path.display());
    Ok(())
}

fn write_output(
    format: Format,
    input: BufReader<File>,
    output: File,
    includes: &[Include],
    pad: u8,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut output = BufWriter::new(output);

    match format {
        Format::Bin => {
            let image = elf2bin(input, includes, pad, &mut output)?;
            info!(
                "Image at {:#010x}, {} bytes",
                image.base_addr,
                image.len()
            );
        }
        Format::Hex => elf2hex(input, includes, &mut output)?,
        Format::Uf2 { family_id } => {
            info!("Using UF2 Family {:#010x}", family_id);
            let image = build_image(input, includes, pad)?;

            if log::max_level() >= LevelFilter::Info {
                let len = (image.len().div_ceil(UF2_PAYLOAD_SIZE) * UF2_BLOCK_SIZE) as u64;
                info!("Writing program to disk");
                let mut reporter = ProgressBarWriter::new(len, &mut output);
                let result = write_uf2(&mut reporter, image.base_addr, family_id, &image.bytes)
                    .map(drop);
                reporter.finish();
                println!();
                result?;
            } else {
                write_uf2(&mut output, image.base_addr, family_id, &image.bytes)?;
            }
        }
    }

    output.flush()?;
    Ok(())
}
