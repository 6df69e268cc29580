//! Report compiler: turns a dataset summary and chart images into a typeset
//! PDF report, with a language model writing the prose sections.
pub mod assemble;
pub mod compile;
pub mod config;
pub mod error;
pub mod lm;
pub mod lm_log;
pub mod markup;
pub mod pipeline;
pub mod plan;
pub mod postprocess;
pub mod process;
pub mod report;
pub mod sections;
pub mod state;
pub mod templates;
pub mod util;
