pub mod sampler;

pub use sampler::{sample, CasePrompt, SampleOptions, SectionOverrides};
