extern crate ffmpeg_next as ffmpeg;

use std::sync::OnceLock;

use crate::error::Error;
use crate::ffi;

/// Initialize global ffmpeg state and redirect its logging to the Rust
/// `tracing` crate. Runs once per process no matter how often it is called;
/// every open entry point calls it, so calling it manually is optional.
pub fn init() -> Result<(), Error> {
    static INIT: OnceLock<Result<(), ffmpeg::Error>> = OnceLock::new();

    INIT.get_or_init(|| {
        ffmpeg::init()?;
        ffi::init_logging();
        Ok(())
    })
    .clone()
    .map_err(Error::from)
}
