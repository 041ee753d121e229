//! Security policy for structured commands run inside project containers.
//!
//! Applied to one-shot execution and managed processes only. Interactive
//! terminals are operator sessions and never pass through here.
//!
//! Commands are always executed as an argument vector, never through a
//! shell, so the blocked patterns target semantic escapes (`rm -rf` handed
//! to an otherwise allowed interpreter, traversal out of the workspace)
//! rather than shell parsing.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path};

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::PolicyConfig;
use crate::errors::PolicyViolation;

#[derive(Debug, Clone)]
enum ArgumentRule {
    Any,
    Only {
        allowed: BTreeSet<String>,
        value_flags: BTreeSet<String>,
    },
}

#[derive(Debug, Clone)]
pub struct CommandPolicy {
    commands: BTreeMap<String, ArgumentRule>,
    blocked: Vec<Regex>,
    forbid_path_separators: bool,
}

impl CommandPolicy {
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        let blocked = config
            .blocked_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("Invalid blocked pattern '{}'", p)))
            .collect::<Result<Vec<_>>>()?;

        let commands = config
            .commands
            .iter()
            .map(|(name, rule)| {
                let rule = if rule.any_args {
                    ArgumentRule::Any
                } else {
                    ArgumentRule::Only {
                        allowed: rule.allowed_args.iter().cloned().collect(),
                        value_flags: rule.value_flags.iter().cloned().collect(),
                    }
                };
                (name.clone(), rule)
            })
            .collect();

        Ok(Self {
            commands,
            blocked,
            forbid_path_separators: config.forbid_path_separators,
        })
    }

    pub fn allowed_commands(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    /// Validate a command before it is executed.
    ///
    /// Rules are applied in order: allowlist, blocked patterns (command,
    /// each argument, cwd), per-command argument rules, relative cwd. The
    /// first failing rule is returned.
    pub fn validate(
        &self,
        command: &str,
        args: &[String],
        cwd: Option<&str>,
    ) -> Result<(), PolicyViolation> {
        if command.is_empty() {
            return Err(PolicyViolation::EmptyCommand);
        }
        let Some(rule) = self.commands.get(command) else {
            return Err(PolicyViolation::CommandNotAllowed {
                command: command.to_string(),
            });
        };

        self.check_blocked("command", command)?;
        for arg in args {
            self.check_blocked("argument", arg)?;
            if arg.starts_with('/') {
                return Err(PolicyViolation::AbsolutePath { value: arg.clone() });
            }
        }
        if let Some(cwd) = cwd {
            self.check_blocked("cwd", cwd)?;
        }

        if let ArgumentRule::Only {
            allowed,
            value_flags,
        } = rule
        {
            let mut iter = args.iter();
            while let Some(arg) = iter.next() {
                if value_flags.contains(arg) {
                    let value = iter.next().ok_or_else(|| PolicyViolation::MissingFlagValue {
                        flag: arg.clone(),
                    })?;
                    check_relative_path("argument", value)?;
                    continue;
                }
                if !allowed.contains(arg) {
                    return Err(PolicyViolation::ArgumentNotAllowed {
                        command: command.to_string(),
                        argument: arg.clone(),
                    });
                }
            }
        }

        if let Some(cwd) = cwd
            && cwd.starts_with('/')
        {
            return Err(PolicyViolation::AbsolutePath {
                value: cwd.to_string(),
            });
        }

        Ok(())
    }

    fn check_blocked(&self, field: &str, value: &str) -> Result<(), PolicyViolation> {
        if let Some(regex) = self.blocked.iter().find(|r| r.is_match(value)) {
            return Err(PolicyViolation::BlockedPattern {
                field: field.to_string(),
                pattern: regex.as_str().to_string(),
            });
        }
        if self.forbid_path_separators && (value.contains('/') || value.contains('\\')) {
            return Err(PolicyViolation::BlockedPattern {
                field: field.to_string(),
                pattern: "/".to_string(),
            });
        }
        Ok(())
    }
}

/// Path-valued flag arguments must stay relative and inside the workspace,
/// whatever the configured blocked patterns are.
fn check_relative_path(field: &str, value: &str) -> Result<(), PolicyViolation> {
    if value.starts_with('/') || value.starts_with('~') {
        return Err(PolicyViolation::AbsolutePath {
            value: value.to_string(),
        });
    }
    if Path::new(value)
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        return Err(PolicyViolation::BlockedPattern {
            field: field.to_string(),
            pattern: "..".to_string(),
        });
    }
    Ok(())
}
