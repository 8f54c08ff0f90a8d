use super::design_parameters::{BUFFER_COUNT, BUFFER_SIZE};
use crate::metadata::ApplicationMetadata;

mod build_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

impl ApplicationMetadata {
    /// Construct the global metadata.
    ///
    /// # Note
    /// This may only be called once.
    ///
    /// # Returns
    /// A reference to the global metadata.
    pub fn new() -> &'static ApplicationMetadata {
        cortex_m::singleton!(: ApplicationMetadata = ApplicationMetadata {
            firmware_version: build_info::GIT_VERSION.unwrap_or("Unspecified"),
            rust_version: build_info::RUSTC_VERSION,
            profile: build_info::PROFILE,
            git_dirty: build_info::GIT_DIRTY.unwrap_or(false),
            features: build_info::FEATURES_STR,
            panic_info: panic_persist::get_panic_message_utf8()
                .unwrap_or("None"),
            buffers: BUFFER_COUNT,
            buffer_size: BUFFER_SIZE,
        })
        .unwrap()
    }
}
