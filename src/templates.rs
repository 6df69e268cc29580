pub const REPORT_TEX: &str = include_str!("../templates/report.tex");
pub const SECTION_TEX: &str = include_str!("../templates/section.tex");

pub const PLAN_PROMPT_MD: &str = include_str!("../prompts/plan.md");
pub const SECTION_PROMPT_MD: &str = include_str!("../prompts/section.md");
pub const NARRATIVE_PROMPT_MD: &str = include_str!("../prompts/narrative.md");
pub const RETRY_PROMPT_MD: &str = include_str!("../prompts/retry.md");
