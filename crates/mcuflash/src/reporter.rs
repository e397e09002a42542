use std::io::{self, Stdout, Write};

use mcuflash_core::ProgressReporter;
use pbr::{ProgressBar, Units};

/// Draws a byte progress bar on stdout for a USB load.
#[derive(Default)]
pub struct ProgressBarReporter {
    pb: Option<ProgressBar<Stdout>>,
}

impl ProgressBarReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressReporter for ProgressBarReporter {
    fn start(&mut self, label: &str, total: u64) {
        let mut pb = ProgressBar::new(total);
        pb.set_units(Units::Bytes);
        pb.message(&format!("{label}: "));
        self.pb = Some(pb);
    }

    fn advance(&mut self, bytes: u64) {
        if let Some(pb) = self.pb.as_mut() {
            pb.add(bytes);
        }
    }

    fn finish(&mut self) {
        if let Some(mut pb) = self.pb.take() {
            pb.finish();
            println!();
        }
    }
}

/// Counts the bytes written through it on a progress bar.
pub struct ProgressBarWriter<T> {
    pb: ProgressBar<Stdout>,
    inner: T,
}

impl<T: Write> ProgressBarWriter<T> {
    pub fn new(total_bytes: u64, inner: T) -> Self {
        let mut pb = ProgressBar::new(total_bytes);
        pb.set_units(Units::Bytes);

        Self { pb, inner }
    }

    pub fn finish(&mut self) {
        self.pb.finish();
    }
}

impl<T: Write> Write for ProgressBarWriter<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.pb.add(written as _);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
