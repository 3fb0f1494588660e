pub mod build;
pub mod launcher;
pub mod supervisor;

#[cfg(test)]
mod test_support;

pub use build::{drive_build, prepare_log_path, resolve_interval};
pub use launcher::{resolve_sampler_path, ProcessLauncher, SamplerHandle, SamplerLauncher};
pub use supervisor::{BuildMode, Supervisor};
