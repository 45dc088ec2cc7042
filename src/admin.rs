//! Admin commands that pass straight through to the plugin manager.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::lifecycle::PluginStatus;
use crate::manager::{PluginInfo, PluginManager};

/// A parsed admin command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    /// List every known plugin.
    List,
    /// Show one plugin.
    Status(String),
    /// Enable a plugin, loading it first if needed.
    Enable(String),
    /// Disable a plugin.
    Disable(String),
    /// Load a plugin.
    Load(String),
    /// Unload a plugin.
    Unload(String),
    /// Rescan the plugin root.
    Rediscover,
}

impl AdminCommand {
    /// Run the command.
    pub async fn execute(&self, manager: &PluginManager) -> Result<AdminOutput> {
        match self {
            Self::List => Ok(AdminOutput::Plugins(manager.list())),
            Self::Status(name) => manager
                .info(name)
                .map(AdminOutput::Plugin)
                .ok_or_else(|| Error::plugin_not_found(name)),
            Self::Enable(name) => {
                let needs_load = manager
                    .status(name)
                    .ok_or_else(|| Error::plugin_not_found(name))?
                    .can_load();
                if needs_load {
                    manager.load_plugin(name).await?;
                }
                manager.enable_plugin(name).await?;
                Ok(done("enable", name, manager.status(name)))
            }
            Self::Disable(name) => {
                manager.disable_plugin(name).await?;
                Ok(done("disable", name, manager.status(name)))
            }
            Self::Load(name) => {
                manager.load_plugin(name).await?;
                Ok(done("load", name, manager.status(name)))
            }
            Self::Unload(name) => {
                manager.unload_plugin(name).await?;
                Ok(done("unload", name, None))
            }
            Self::Rediscover => {
                let added = manager.rediscover().into_iter().map(|m| m.name).collect();
                Ok(AdminOutput::Discovered(added))
            }
        }
    }
}

fn done(action: &'static str, plugin: &str, status: Option<PluginStatus>) -> AdminOutput {
    AdminOutput::Done {
        action,
        plugin: plugin.to_string(),
        status,
    }
}

impl FromStr for AdminCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut words = s.split_whitespace();
        let verb = words
            .next()
            .ok_or_else(|| Error::InvalidCommand("empty command".to_string()))?
            .to_ascii_lowercase();
        let arg = words.next().map(str::to_string);

        if let Some(extra) = words.next() {
            return Err(Error::InvalidCommand(format!("unexpected argument: {}", extra)));
        }

        let named = |make: fn(String) -> Self| {
            arg.clone()
                .map(make)
                .ok_or_else(|| Error::InvalidCommand(format!("{} requires a plugin name", verb)))
        };

        match verb.as_str() {
            "list" | "ls" => Ok(Self::List),
            "status" => named(Self::Status),
            "enable" => named(Self::Enable),
            "disable" => named(Self::Disable),
            "load" => named(Self::Load),
            "unload" => named(Self::Unload),
            "rediscover" | "discover" => Ok(Self::Rediscover),
            other => Err(Error::InvalidCommand(format!("unknown command: {}", other))),
        }
    }
}

/// Result of an admin command.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdminOutput {
    /// Plugin listing.
    Plugins(Vec<PluginInfo>),
    /// One plugin.
    Plugin(PluginInfo),
    /// A completed transition.
    Done {
        /// Command that ran.
        action: &'static str,
        /// Target plugin.
        plugin: String,
        /// Status afterwards; absent once unloaded.
        status: Option<PluginStatus>,
    },
    /// Plugins newly found by discovery.
    Discovered(Vec<String>),
}

impl fmt::Display for AdminOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plugins(plugins) if plugins.is_empty() => writeln!(f, "no plugins"),
            Self::Plugins(plugins) => {
                writeln!(f, "{:<24} {:<10} {:<10} {:>6}", "NAME", "VERSION", "STATUS", "ROUTES")?;
                for p in plugins {
                    writeln!(f, "{:<24} {:<10} {:<10} {:>6}", p.name, p.version, p.status, p.routes)?;
                }
                Ok(())
            }
            Self::Plugin(p) => {
                writeln!(f, "{} {} ({})", p.name, p.version, p.category)?;
                writeln!(f, "  status: {}", p.status)?;
                writeln!(f, "  routes: {}", p.routes)?;
                if !p.dependencies.is_empty() {
                    writeln!(f, "  depends on: {}", p.dependencies.join(", "))?;
                }
                if let Some(ref err) = p.last_error {
                    writeln!(f, "  last error: {}", err)?;
                }
                Ok(())
            }
            Self::Done {
                action,
                plugin,
                status: Some(status),
            } => writeln!(f, "{} {}: {}", action, plugin, status),
            Self::Done { action, plugin, .. } => writeln!(f, "{} {}: done", action, plugin),
            Self::Discovered(names) if names.is_empty() => writeln!(f, "no new plugins"),
            Self::Discovered(names) => writeln!(f, "discovered: {}", names.join(", ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!("list".parse::<AdminCommand>().unwrap(), AdminCommand::List);
        assert_eq!(
            "  ENABLE tasks ".parse::<AdminCommand>().unwrap(),
            AdminCommand::Enable("tasks".into())
        );
        assert_eq!(
            "unload chat".parse::<AdminCommand>().unwrap(),
            AdminCommand::Unload("chat".into())
        );
        assert_eq!("rediscover".parse::<AdminCommand>().unwrap(), AdminCommand::Rediscover);
    }

    #[test]
    fn test_parse_errors() {
        for line in ["", "enable", "explode tasks", "status a b"] {
            let err = line.parse::<AdminCommand>().unwrap_err();
            assert!(matches!(err, Error::InvalidCommand(_)), "{line}");
        }
    }

    #[test]
    fn test_output_rendering() {
        let out = done("disable", "tasks", Some(PluginStatus::Disabled));
        assert_eq!(out.to_string(), "disable tasks: disabled\n");

        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["kind"], "done");
        assert_eq!(json["status"], "disabled");

        assert_eq!(AdminOutput::Plugins(vec![]).to_string(), "no plugins\n");
    }
}
