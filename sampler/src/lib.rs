pub mod aggregate;
pub mod memory;
pub mod metrics;
pub mod sampler;

pub use aggregate::{AggregateStats, Sample, Summary};
pub use metrics::{default_source, MetricsSource, Reading, SysinfoSource, TargetExited};
pub use sampler::{Sampler, SamplerState};
