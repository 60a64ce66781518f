// Re-export all items from the submodules
mod agent_config;
mod removal_policy;
mod rule_set;

// Re-export agent config
pub use agent_config::{load_or_create_config, AgentConfig, AuthMethod, CertVerify};

// Re-export removal policy
pub use removal_policy::RemovalPolicy;

// Re-export rule set types
pub use rule_set::{LegacyRules, MetaSpec, RuleEntry, RuleSet};
