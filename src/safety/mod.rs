//! Script Safety Analysis
//!
//! This module screens script text before it is dispatched to an instance.
//! A data-driven rule table (category, patterns, action) is compiled once
//! at analyzer construction; any `block` match rejects the script
//! regardless of the requested execution mode.
//!
//! # Two Layers
//! 1. The regex rule table classifies known dangerous constructs
//!    (record deletion, bulk operations, system property writes, role and
//!    credential manipulation, outbound network calls).
//! 2. Independently of the table, `readonly` mode rejects any script the
//!    lexical scan recognizes as capable of mutation. The scan works on
//!    identifier tokens, not regex rules, so a pattern gap in the table
//!    still cannot put a mutating call through in readonly mode.
//!
//! # Guardrail, Not a Security Boundary
//! The analyzer complements - never replaces - the instance's own access
//! control. It cannot see obfuscated payloads (string-built code fed to
//! eval), calls routed through script includes, or execution in another
//! scope. Matching is over the raw script text, so a dangerous call inside
//! a comment also triggers; over-blocking is the accepted failure mode.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{NowgateError, Result};

/// Execution mode governing how much mutation a submitted script may perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// No mutation permitted; mutating scripts are rejected before dispatch
    ReadOnly,
    /// Script runs inside a transaction that is always rolled back
    DryRun,
    /// Script runs and commits
    Execute,
}

impl ExecutionMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "readonly",
            Self::DryRun => "dryrun",
            Self::Execute => "execute",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = NowgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "readonly" => Ok(Self::ReadOnly),
            "dryrun" => Ok(Self::DryRun),
            "execute" => Ok(Self::Execute),
            other => Err(NowgateError::unknown(format!(
                "Unknown execution mode '{other}'. Expected one of: readonly, dryrun, execute"
            ))),
        }
    }
}

/// Dangerous-operation categories the rule table covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    RecordDeletion,
    BulkOperation,
    SystemPropertyWrite,
    RoleCredentialManipulation,
    OutboundNetwork,
}

impl RuleCategory {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RecordDeletion => "record_deletion",
            Self::BulkOperation => "bulk_operation",
            Self::SystemPropertyWrite => "system_property_write",
            Self::RoleCredentialManipulation => "role_credential_manipulation",
            Self::OutboundNetwork => "outbound_network",
        }
    }
}

impl std::fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a rule match does to the verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Reject the script regardless of mode
    Block,
    /// Let the script through with a surfaced warning
    Warn,
}

/// A compiled safety rule
#[derive(Debug)]
pub struct SafetyRule {
    pub category: RuleCategory,
    pub action: RuleAction,
    pub description: &'static str,
    patterns: Vec<Regex>,
}

impl SafetyRule {
    fn matches(&self, script: &str) -> usize {
        self.patterns.iter().filter(|p| p.is_match(script)).count()
    }
}

/// Declarative rule source, compiled into [`SafetyRule`]s at construction
struct RuleSpec {
    category: RuleCategory,
    action: RuleAction,
    description: &'static str,
    patterns: &'static [&'static str],
}

/// The default rule table, ordered most-severe first
const DEFAULT_RULES: &[RuleSpec] = &[
    RuleSpec {
        category: RuleCategory::RecordDeletion,
        action: RuleAction::Block,
        description: "record deletion",
        patterns: &[
            r"\bdeleteMultiple\s*\(",
            r"\bdeleteRecord\s*\(",
            r"\bGlideMultipleDelete\b",
            r"\bTableUtils\b[\s\S]{0,80}\bdrop",
        ],
    },
    RuleSpec {
        category: RuleCategory::BulkOperation,
        action: RuleAction::Block,
        description: "bulk or unfiltered write",
        patterns: &[r"\bupdateMultiple\s*\(", r"\bGlideMultipleUpdate\b"],
    },
    RuleSpec {
        category: RuleCategory::SystemPropertyWrite,
        action: RuleAction::Block,
        description: "system property write",
        patterns: &[
            r"\bgs\.setProperty\s*\(",
            r#"GlideRecord\s*\(\s*['"]sys_properties['"]"#,
        ],
    },
    RuleSpec {
        category: RuleCategory::RoleCredentialManipulation,
        action: RuleAction::Block,
        description: "role or credential manipulation",
        patterns: &[
            r#"GlideRecord\s*\(\s*['"]sys_user_has_role['"]"#,
            r#"GlideRecord\s*\(\s*['"]sys_user_role['"]"#,
            r"\bsetPassword\s*\(",
            r"\bimpersonate\s*\(",
        ],
    },
    RuleSpec {
        category: RuleCategory::OutboundNetwork,
        action: RuleAction::Block,
        description: "outbound network call from script",
        patterns: &[
            r"\bGlideHTTPRequest\b",
            r"\bRESTMessageV2\b",
            r"\bSOAPMessageV2\b",
            r"\bXMLHttpRequest\b",
        ],
    },
    RuleSpec {
        category: RuleCategory::BulkOperation,
        action: RuleAction::Warn,
        description: "business rules disabled for writes",
        patterns: &[r"\bsetWorkflow\s*\(\s*false"],
    },
];

/// Identifier tokens that mark a script as capable of mutation
///
/// Used by the readonly-mode layer; deliberately broader than the rule
/// table and matched lexically, not by pattern.
const MUTATING_TOKENS: &[&str] = &[
    "insert",
    "insertMultiple",
    "insertWithReferences",
    "update",
    "updateMultiple",
    "updateWithReferences",
    "deleteRecord",
    "deleteMultiple",
    "setValue",
    "setProperty",
    "setPassword",
    "setWorkflow",
    "impersonate",
    "eval",
    "executeNow",
];

/// The verdict for one script submission
#[derive(Debug, Clone, Serialize)]
pub struct SafetyVerdict {
    pub approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_category: Option<RuleCategory>,
    /// Warn-rule matches; present on approved verdicts too
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Number of blocked mutating constructs (0 when approved)
    pub mutations_blocked: u32,
}

impl SafetyVerdict {
    fn approved(warnings: Vec<String>) -> Self {
        Self { approved: true, reason: None, matched_category: None, warnings, mutations_blocked: 0 }
    }
}

/// The analyzer: a compiled rule table plus the mode-enforcement layer
pub struct SafetyAnalyzer {
    rules: Vec<SafetyRule>,
}

impl SafetyAnalyzer {
    /// Compile the default rule table
    pub fn new() -> Result<Self> {
        Self::from_specs(DEFAULT_RULES)
    }

    fn from_specs(specs: &[RuleSpec]) -> Result<Self> {
        let mut rules = Vec::with_capacity(specs.len());
        for spec in specs {
            let mut patterns = Vec::with_capacity(spec.patterns.len());
            for pattern in spec.patterns {
                let compiled = Regex::new(pattern).map_err(|e| {
                    NowgateError::unknown(format!("Invalid safety rule pattern '{pattern}': {e}"))
                })?;
                patterns.push(compiled);
            }
            rules.push(SafetyRule {
                category: spec.category,
                action: spec.action,
                description: spec.description,
                patterns,
            });
        }
        Ok(Self { rules })
    }

    /// The compiled rules, in evaluation order
    #[must_use]
    pub fn rules(&self) -> &[SafetyRule] {
        &self.rules
    }

    /// Classify a script against the rule table and the requested mode
    ///
    /// Block matches reject in every mode. With no block match, `readonly`
    /// additionally rejects scripts the lexical scan marks as mutating;
    /// `dryrun` and `execute` approve, carrying any warn matches.
    #[must_use]
    pub fn analyze(&self, script: &str, mode: ExecutionMode) -> SafetyVerdict {
        if script.trim().is_empty() {
            return SafetyVerdict {
                approved: false,
                reason: Some("Script is empty".to_string()),
                matched_category: None,
                warnings: Vec::new(),
                mutations_blocked: 0,
            };
        }

        let mut warnings = Vec::new();
        let mut blocked_category: Option<RuleCategory> = None;
        let mut blocked_description = "";
        let mut mutations_blocked: u32 = 0;

        for rule in &self.rules {
            let matches = rule.matches(script);
            if matches == 0 {
                continue;
            }
            match rule.action {
                RuleAction::Block => {
                    mutations_blocked += matches as u32;
                    if blocked_category.is_none() {
                        blocked_category = Some(rule.category);
                        blocked_description = rule.description;
                    }
                }
                RuleAction::Warn => {
                    warnings.push(format!("{} ({})", rule.description, rule.category));
                }
            }
        }

        if let Some(category) = blocked_category {
            return SafetyVerdict {
                approved: false,
                reason: Some(format!(
                    "Script contains {blocked_description}, which is not allowed through this tool"
                )),
                matched_category: Some(category),
                warnings,
                mutations_blocked,
            };
        }

        // Mode layer: independent of the pattern table
        if mode == ExecutionMode::ReadOnly {
            let tokens = mutating_tokens_in(script);
            if !tokens.is_empty() {
                return SafetyVerdict {
                    approved: false,
                    reason: Some(format!(
                        "Mode is readonly but the script can mutate (found: {})",
                        tokens.join(", ")
                    )),
                    matched_category: None,
                    warnings,
                    mutations_blocked: tokens.len() as u32,
                };
            }
        }

        SafetyVerdict::approved(warnings)
    }
}

/// Lexical scan for mutating identifier tokens
///
/// Splits the script into identifier tokens and reports which members of
/// the mutating set appear. Case-sensitive: instance-side APIs are.
fn mutating_tokens_in(script: &str) -> Vec<&'static str> {
    let mut found = Vec::new();
    for token in script.split(|c: char| !c.is_ascii_alphanumeric() && c != '_') {
        if token.is_empty() {
            continue;
        }
        if let Some(hit) = MUTATING_TOKENS.iter().find(|t| **t == token) {
            if !found.contains(hit) {
                found.push(*hit);
            }
        }
    }
    found
}
