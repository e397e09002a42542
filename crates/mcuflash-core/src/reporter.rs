/// Receives progress of a long running transfer, in bytes.
pub trait ProgressReporter {
    fn start(&mut self, label: &str, total: u64);

    fn advance(&mut self, bytes: u64);

    fn finish(&mut self);
}

/// Reports nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn start(&mut self, _label: &str, _total: u64) {}

    fn advance(&mut self, _bytes: u64) {}

    fn finish(&mut self) {}
}

impl<P: ProgressReporter + ?Sized> ProgressReporter for &mut P {
    fn start(&mut self, label: &str, total: u64) {
        (**self).start(label, total)
    }

    fn advance(&mut self, bytes: u64) {
        (**self).advance(bytes)
    }

    fn finish(&mut self) {
        (**self).finish()
    }
}
