//! Nuage orchagent command line.
//!
//! Offline tools around the VSD adapter: translating a security group rule
//! into the ACL entries it produces, cleaning up unused policy groups, and
//! printing the effective configuration.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nuage_orchagent::audit::{init_logging, init_logging_pretty};
use nuage_orchagent::policy::{
    needs_reverse, MappingTarget, PolicyGroupKind, PolicyGroupManager, ResolvedRemote, RuleMapper, RuleMatch,
    SecurityRule,
};
use nuage_orchagent::{AgentConfig, InMemoryStore};
use nuage_vsd::{HttpClient, IgnoreErrors};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

/// Nuage VSD control-plane adapter
#[derive(Parser, Debug)]
#[command(name = "nuage-orchagent")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Agent configuration file (YAML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Translate a security group rule into VSD ACL entries
    Translate {
        /// JSON file holding a single security group rule
        rule: PathBuf,

        /// The owning security group is stateless
        #[arg(long)]
        stateless: bool,

        /// Translate for a hardware (gateway) policy group
        #[arg(long)]
        hardware: bool,
    },

    /// Delete the policy groups of security groups no vport uses anymore
    CheckUnused {
        /// Security group ids
        #[arg(required = true)]
        sg_ids: Vec<String>,

        /// Check hardware policy groups instead of software ones
        #[arg(long)]
        hardware: bool,
    },

    /// Print the effective configuration
    ShowConfig,
}

fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    match path {
        Some(path) => AgentConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(AgentConfig::default()),
    }
}

fn policy_group_kind(hardware: bool) -> PolicyGroupKind {
    if hardware {
        PolicyGroupKind::Hardware
    } else {
        PolicyGroupKind::Software
    }
}

/// Remote placeholders stand in for the VSD ids that a live run resolves.
fn offline_remote(rule: &RuleMatch) -> ResolvedRemote {
    use nuage_orchagent::policy::types::RemoteSpec;

    match &rule.remote {
        RemoteSpec::Unset => ResolvedRemote::None,
        RemoteSpec::Prefix(prefix) => ResolvedRemote::Macro(format!("<macro {}>", prefix)),
        RemoteSpec::Group(group) => ResolvedRemote::PolicyGroup(format!("<policy group {}>", group)),
    }
}

fn translate(config: &AgentConfig, path: &Path, stateless: bool, hardware: bool) -> Result<()> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let rule: SecurityRule = serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    let normalized = rule.normalize()?;

    let mapper = RuleMapper::new(config.flow_logging_enabled, config.stats_collection_enabled);
    let target = MappingTarget {
        location_id: format!("<policy group {}>", rule.security_group_id),
        kind: policy_group_kind(hardware),
        stateful: !stateless,
        dhcp_managed: true,
    };

    let mut rules = vec![normalized.clone()];
    if needs_reverse(&normalized, target.stateful) {
        rules.push(normalized.reversed());
    }

    let entries: Vec<_> = rules
        .iter()
        .map(|rule| {
            let entry = mapper.map(rule, &target, &offline_remote(rule));
            json!({
                "template": rule.direction.acl_direction().template_resource().entity_name(),
                "entry": entry,
            })
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}

async fn check_unused(config: &AgentConfig, sg_ids: &[String], hardware: bool) -> Result<()> {
    let client = HttpClient::new(config.vsd.clone()).context("connecting to the VSD")?;
    let mut manager = PolicyGroupManager::new(
        config.policy_group_config(),
        Arc::new(IgnoreErrors::new(client)),
        Arc::new(InMemoryStore::new()),
    );

    let deleted = manager.check_unused(sg_ids, policy_group_kind(hardware)).await?;
    info!(deleted, "Unused policy groups removed");
    println!("{}", deleted);
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Translate {
            rule,
            stateless,
            hardware,
        } => translate(&config, &rule, stateless, hardware),
        Command::CheckUnused { sg_ids, hardware } => check_unused(&config, &sg_ids, hardware).await,
        Command::ShowConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.json_logs {
        init_logging(&args.log_level);
    } else {
        init_logging_pretty(&args.log_level);
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
