pub mod rules;
pub mod spider;
pub mod task;

// Re-export common types
pub use rules::{expand_macros, RuleError, RulePattern, RuleSet};
pub use spider::{Spider, SpiderError, SpiderSettings, SpiderState, VisitCallback, VisitedCallback};
pub use task::{CrawlTask, TaskError, PAYLOAD_SEPARATOR};
