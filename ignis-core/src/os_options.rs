#![allow(unused_imports)]
#![allow(dead_code)]
#[cfg(unix)]
pub(crate) use std::os::unix::fs::OpenOptionsExt;

#[cfg(windows)]
pub(crate) trait OpenOptionsExt {
    fn custom_flags(&mut self, flags: u32) -> &mut Self;
}

#[cfg(windows)]
impl OpenOptionsExt for std::fs::OpenOptions {
    fn custom_flags(&mut self, _flags: u32) -> &mut Self {
        // Windows takes its exclusive-access flags through `CreateFileW`
        // rather than `std::fs::OpenOptions`; wiring that up needs
        // `windows-sys` directly. Placeholder until the Windows port.
        self
    }
}
