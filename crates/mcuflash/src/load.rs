use std::{
    fs::File,
    io::{BufReader, Seek},
    path::PathBuf,
};

use log::{info, LevelFilter};
use mcuflash_core::{
    build_image,
    elf::open_elf,
    targets::{detect_target, flash},
    usb::BusAddr,
    Include, NoProgress, Target,
};

use crate::{convert::default_input, reporter::ProgressBarReporter};

pub fn load(
    input: Option<PathBuf>,
    includes: &[Include],
    pad: u8,
    target: Option<Target>,
    bus_addr: Option<BusAddr>,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let input_path = match input {
        Some(path) => path,
        None => default_input()?,
    };

    let mut input = BufReader::new(File::open(&input_path)?);

    let target = match target {
        Some(target) => target,
        None => {
            let mut elf = open_elf(&mut input)?;
            let target = detect_target(&mut elf, &input_path.display().to_string())?;
            info!("Detected target {target}");
            target
        }
    };

    input.rewind()?;
    let image = build_image(input, includes, pad)?;

    if quiet || log::max_level() < LevelFilter::Info {
        flash(target, image, pad, bus_addr, &mut NoProgress)?;
    } else {
        flash(target, image, pad, bus_addr, &mut ProgressBarReporter::new())?;
    }

    info!("Done");
    Ok(())
}
