// src/ctl/mod.rs

//! `stewardctl`: the operator tool. Reads cluster state straight from the
//! DCS, talks to agents over their REST API for the fast paths, and falls
//! back to DCS keys when an agent cannot be reached. Destructive commands
//! prompt unless `--force` is given; every precondition failure exits
//! non-zero with a descriptive message.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command as ProcessCommand;
use url::Url;

use crate::config::DcsConfig;
use crate::core::cluster::{ClusterView, FailoverRequest, Member};
use crate::core::dcs::{self, DcsClient};

/// The request timeout for all ctl-side DCS and API calls.
const CTL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "stewardctl", about = "Operator tool for steward clusters")]
pub struct Ctl {
    /// Path to the ctl configuration file.
    #[arg(short = 'c', long, global = true)]
    pub config_file: Option<PathBuf>,

    /// DCS endpoint override, host:port or a full URL.
    #[arg(short = 'd', long, global = true)]
    pub dcs: Option<String>,

    #[command(subcommand)]
    pub command: CtlCommand,
}

#[derive(Debug, Subcommand)]
pub enum CtlCommand {
    /// List the members of a cluster.
    List {
        cluster: String,
        #[arg(short, long, value_enum, default_value = "pretty")]
        format: OutputFormat,
    },
    /// Alias of list.
    Members {
        cluster: String,
        #[arg(short, long, value_enum, default_value = "pretty")]
        format: OutputFormat,
    },
    /// Fail over to a new leader.
    Failover {
        cluster: String,
        #[arg(long)]
        master: Option<String>,
        #[arg(long)]
        candidate: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Restart cluster members.
    Restart {
        cluster: String,
        member: Option<String>,
        /// Restart a single arbitrary member instead of all of them.
        #[arg(long)]
        any: bool,
        #[arg(long)]
        force: bool,
    },
    /// Reinitialize a replica from the current leader.
    Reinit {
        cluster: String,
        member: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Remove all DCS information of a cluster.
    Remove { cluster: String },
    /// Run SQL against a cluster member.
    Query {
        cluster: String,
        #[arg(long)]
        member: Option<String>,
        #[arg(long, value_enum)]
        role: Option<Role>,
        #[arg(long)]
        command: Option<String>,
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long, default_value = "postgres")]
        dbname: String,
        #[arg(long)]
        username: Option<String>,
    },
    /// Print connection parameters for a cluster member.
    Dsn {
        cluster: String,
        #[arg(long)]
        member: Option<String>,
        #[arg(long, value_enum)]
        role: Option<Role>,
    },
    /// Write a ctl configuration file (uses the global --dcs and
    /// --config-file options).
    Configure {
        #[arg(short = 'n', long, default_value = "/service")]
        namespace: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    Master,
    Replica,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Tsv,
    Json,
}

/// The ctl-side configuration: just enough to find the DCS.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CtlConfig {
    #[serde(default)]
    pub dcs: DcsConfig,
}

/// Writes a ctl configuration, creating parent directories as needed.
pub fn store_config(config: &CtlConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Could not create directory '{}'", parent.display()))?;
    }
    let rendered = toml::to_string_pretty(config)?;
    std::fs::write(path, rendered)
        .with_context(|| format!("Could not write configuration file '{}'", path.display()))?;
    Ok(())
}

/// Loads the ctl configuration. A missing file yields defaults; an
/// unreadable or malformed one fails loudly, naming the path.
pub fn load_config(path: &Path, dcs_override: Option<&str>) -> Result<CtlConfig> {
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Could not load configuration file '{}'", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Could not load configuration file '{}'", path.display()))?
    } else {
        CtlConfig::default()
    };

    if let Some(endpoint) = dcs_override {
        config.dcs.endpoints = vec![parse_dcs_endpoint(endpoint)?];
    }
    Ok(config)
}

/// Accepts `host:port`, `host`, or a full URL.
pub fn parse_dcs_endpoint(value: &str) -> Result<Url> {
    let candidate = if value.contains("://") {
        value.to_string()
    } else {
        format!("http://{value}")
    };
    Url::parse(&candidate).with_context(|| format!("Invalid DCS endpoint '{value}'"))
}

fn default_config_path() -> PathBuf {
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".config/steward/stewardctl.toml"),
        Err(_) => PathBuf::from("stewardctl.toml"),
    }
}

fn get_dcs(config: &CtlConfig, scope: &str) -> Result<Arc<dyn DcsClient>> {
    dcs::from_config(&config.dcs, scope, CTL_TIMEOUT).map_err(|e| anyhow!("{e}"))
}

// --- Pure decision helpers, shared with the tests ---

/// Validates an operator failover request against a snapshot. Returns the
/// resolved (master, candidate) pair.
pub fn validate_failover(
    cluster: &ClusterView,
    scope: &str,
    master: &str,
    candidate: Option<&str>,
) -> Result<(String, String)> {
    let Some(leader) = cluster.leader_name() else {
        bail!("This cluster has no master");
    };
    if master != leader {
        bail!("{master} is not the leader of cluster {scope}");
    }

    let replicas = cluster.replicas();
    if replicas.is_empty() {
        bail!("No candidates found to failover to");
    }

    let candidate = match candidate {
        Some(candidate) => {
            if candidate == master {
                bail!("Failover target and source are the same");
            }
            if !cluster.has_member(candidate) {
                bail!("{candidate} does not exist");
            }
            candidate.to_string()
        }
        // No explicit target: any replica will do, the DCS race decides.
        None => replicas[0].name.clone(),
    };
    Ok((master.to_string(), candidate))
}

/// Validates the three confirmations of a `remove` command.
pub fn check_remove_confirmations(
    cluster: &ClusterView,
    scope: &str,
    entered_scope: &str,
    confirmation: &str,
    entered_master: Option<&str>,
) -> Result<()> {
    if entered_scope != scope {
        bail!("Cluster names specified do not match");
    }
    if confirmation != "Yes I am aware" {
        bail!("You did not exactly type \"Yes I am aware\"");
    }
    if let Some(leader) = cluster.leader_name()
        && entered_master != Some(leader)
    {
        bail!("You did not specify the current master of the cluster");
    }
    Ok(())
}

/// Picks the member a query or dsn should target.
pub fn select_member<'a>(
    cluster: &'a ClusterView,
    member: Option<&str>,
    role: Option<Role>,
) -> Result<&'a Member> {
    if member.is_some() && role.is_some() {
        bail!("--member and --role are mutually exclusive");
    }
    if let Some(name) = member {
        return cluster
            .member(name)
            .ok_or_else(|| anyhow!("Can not find member {name}"));
    }
    let selected = match role.unwrap_or(Role::Any) {
        Role::Master => cluster.leader_member(),
        Role::Replica => cluster.replicas().first().copied(),
        Role::Any => cluster.members.first(),
    };
    selected.ok_or_else(|| anyhow!("No member matches the requested role"))
}

/// Renders the member table in the requested format.
pub fn format_members(cluster: &ClusterView, scope: &str, format: OutputFormat) -> String {
    let rows: Vec<(String, String, String, String)> = cluster
        .members
        .iter()
        .map(|m| {
            let (host, port) = m
                .conn_host_port()
                .map(|(h, p)| (h, p.to_string()))
                .unwrap_or_default();
            let role = if cluster.is_leader(&m.name) {
                "Leader".to_string()
            } else {
                "Replica".to_string()
            };
            (scope.to_string(), m.name.clone(), format!("{host}:{port}"), role)
        })
        .collect();

    match format {
        OutputFormat::Json => {
            let objects: Vec<serde_json::Value> = rows
                .iter()
                .map(|(cluster, member, host, role)| {
                    serde_json::json!({
                        "cluster": cluster, "member": member, "host": host, "role": role,
                    })
                })
                .collect();
            serde_json::to_string_pretty(&objects).unwrap_or_default()
        }
        OutputFormat::Tsv => rows
            .iter()
            .map(|(c, m, h, r)| format!("{c}\t{m}\t{h}\t{r}"))
            .collect::<Vec<_>>()
            .join("\n"),
        OutputFormat::Pretty => {
            let mut out = format!(
                "{:<12} {:<12} {:<22} {:<8}\n",
                "Cluster", "Member", "Host", "Role"
            );
            for (c, m, h, r) in &rows {
                out.push_str(&format!("{c:<12} {m:<12} {h:<22} {r:<8}\n"));
            }
            out
        }
    }
}

// --- Interactive helpers ---

fn prompt(message: &str) -> Result<String> {
    print!("{message}: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn confirm(message: &str) -> Result<bool> {
    let answer = prompt(&format!("{message} [y/N]"))?;
    Ok(answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes"))
}

// --- Command implementations ---

pub async fn run(args: Ctl) -> Result<()> {
    let config_path = args
        .config_file
        .clone()
        .unwrap_or_else(default_config_path);

    match args.command {
        CtlCommand::Configure { namespace } => {
            let endpoint = args
                .dcs
                .as_deref()
                .ok_or_else(|| anyhow!("--dcs is required for configure"))?;
            let config = CtlConfig {
                dcs: DcsConfig {
                    scheme: "etcd".to_string(),
                    endpoints: vec![parse_dcs_endpoint(endpoint)?],
                    namespace,
                },
            };
            store_config(&config, &config_path)
        }
        command => {
            let config = load_config(&config_path, args.dcs.as_deref())?;
            dispatch(command, &config).await
        }
    }
}

async fn dispatch(command: CtlCommand, config: &CtlConfig) -> Result<()> {
    match command {
        CtlCommand::List { cluster, format } | CtlCommand::Members { cluster, format } => {
            let dcs = get_dcs(config, &cluster)?;
            let view = dcs.get_cluster().await?;
            print!("{}", format_members(&view, &cluster, format));
            Ok(())
        }
        CtlCommand::Failover {
            cluster,
            master,
            candidate,
            force,
        } => failover(config, &cluster, master, candidate, force).await,
        CtlCommand::Restart {
            cluster,
            member,
            any,
            force,
        } => member_action(config, &cluster, member, any, force, "restart").await,
        CtlCommand::Reinit {
            cluster,
            member,
            force,
        } => member_action(config, &cluster, member, false, force, "reinitialize").await,
        CtlCommand::Remove { cluster } => remove(config, &cluster).await,
        CtlCommand::Query {
            cluster,
            member,
            role,
            command,
            file,
            dbname,
            username,
        } => query(config, &cluster, member, role, command, file, dbname, username).await,
        CtlCommand::Dsn {
            cluster,
            member,
            role,
        } => {
            let dcs = get_dcs(config, &cluster)?;
            let view = dcs.get_cluster().await?;
            let selected = select_member(&view, member.as_deref(), role)?;
            let (host, port) = selected
                .conn_host_port()
                .ok_or_else(|| anyhow!("Member {} has no usable address", selected.name))?;
            println!("host={host} port={port}");
            Ok(())
        }
        CtlCommand::Configure { .. } => unreachable!("handled before dispatch"),
    }
}

/// Manual failover: fast path over the leader's API, slow path through the
/// DCS `failover` key. Both converge to the same final state; the output
/// names which path ran.
async fn failover(
    config: &CtlConfig,
    scope: &str,
    master: Option<String>,
    candidate: Option<String>,
    force: bool,
) -> Result<()> {
    let dcs = get_dcs(config, scope)?;
    let cluster = dcs.get_cluster().await?;

    let current = cluster.leader_name().unwrap_or_default().to_string();
    let master = match master {
        Some(master) => master,
        None if force => current.clone(),
        None => {
            let entered = prompt(&format!("Master [{current}]"))?;
            if entered.is_empty() { current.clone() } else { entered }
        }
    };
    let candidate = match candidate {
        Some(candidate) => Some(candidate),
        None if force => None,
        None => {
            let entered = prompt("Candidate")?;
            if entered.is_empty() { None } else { Some(entered) }
        }
    };

    let (master, candidate) = validate_failover(&cluster, scope, &master, candidate.as_deref())?;

    if !force {
        print!("{}", format_members(&cluster, scope, OutputFormat::Pretty));
        if !confirm(&format!("Are you sure you want to failover cluster {scope}"))? {
            bail!("Aborting failover");
        }
    }

    let request = FailoverRequest::new(Some(master.clone()), Some(candidate.clone()));
    let leader_member = cluster
        .leader_member()
        .ok_or_else(|| anyhow!("This cluster has no master"))?;

    match post_to_member(leader_member, "failover", Some(&request)).await {
        Ok(status) if status.is_success() => {
            println!("Failing over to new leader {candidate}");
            return Ok(());
        }
        Ok(status) => bail!("Failover failed, details: {status}"),
        Err(e) => {
            println!("Could not failover using the leader API ({e}), falling back to DCS");
            dcs.set_failover_value(&request).await?;
        }
    }

    // Slow path: the leader consumes the key on its next tick. Wait for
    // the lease to move.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        let view = dcs.get_cluster().await.unwrap_or_default();
        if view.leader_name() == Some(candidate.as_str()) {
            println!("Failing over to new leader {candidate}");
            print!("{}", format_members(&view, scope, OutputFormat::Pretty));
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("Failover failed: the leader did not change");
        }
        let _ = dcs.watch(Duration::from_secs(2)).await;
    }
}

/// POSTs a control request to a member's REST API.
async fn post_to_member(
    member: &Member,
    endpoint: &str,
    request: Option<&FailoverRequest>,
) -> Result<reqwest::StatusCode> {
    if member.api_url.is_empty() {
        bail!("member {} has no API address", member.name);
    }
    let http = reqwest::Client::builder().timeout(CTL_TIMEOUT).build()?;
    let url = format!("{}/{endpoint}", member.api_url.trim_end_matches('/'));
    let mut builder = http.post(&url);
    if let Some(request) = request {
        builder = builder.json(request);
    }
    let response = builder.send().await?;
    Ok(response.status())
}

/// Restart or reinitialize one, any, or every member through their APIs.
async fn member_action(
    config: &CtlConfig,
    scope: &str,
    member: Option<String>,
    any: bool,
    force: bool,
    endpoint: &str,
) -> Result<()> {
    let dcs = get_dcs(config, scope)?;
    let cluster = dcs.get_cluster().await?;

    let targets: Vec<Member> = match &member {
        Some(name) => match cluster.member(name) {
            Some(found) => vec![found.clone()],
            None => bail!("{name} is not a member of cluster {scope}"),
        },
        None if any => cluster.members.first().cloned().into_iter().collect(),
        None => cluster.members.clone(),
    };
    if targets.is_empty() {
        bail!("Cluster {scope} has no members");
    }

    if !force {
        let names: Vec<&str> = targets.iter().map(|m| m.name.as_str()).collect();
        if !confirm(&format!(
            "Are you sure you want to {endpoint} members {}",
            names.join(", ")
        ))? {
            bail!("Aborting {endpoint}");
        }
    }

    for target in &targets {
        match post_to_member(target, endpoint, None).await {
            Ok(status) if status.is_success() => {
                println!("Success: {endpoint} on member {}", target.name)
            }
            Ok(status) => println!(
                "Failed: {endpoint} for member {}, status: {status}",
                target.name
            ),
            Err(e) => println!("Failed: {endpoint} for member {}: {e}", target.name),
        }
    }
    Ok(())
}

/// Remove every DCS record of a cluster, guarded by three confirmations.
async fn remove(config: &CtlConfig, scope: &str) -> Result<()> {
    let dcs = get_dcs(config, scope)?;
    let cluster = dcs.get_cluster().await?;
    print!("{}", format_members(&cluster, scope, OutputFormat::Pretty));

    let entered_scope = prompt("Please confirm the cluster name to remove")?;
    println!(
        "You are about to remove all information in DCS for {scope}, please type: \"Yes I am aware\""
    );
    let confirmation = prompt("Confirm")?;
    let entered_master = if cluster.has_leader() {
        Some(prompt("Which master is the cluster currently running on?")?)
    } else {
        None
    };

    check_remove_confirmations(
        &cluster,
        scope,
        &entered_scope,
        &confirmation,
        entered_master.as_deref(),
    )?;

    dcs.delete_cluster().await?;
    println!("Removed cluster {scope} from the DCS");
    Ok(())
}

/// Run SQL against one member through psql.
#[allow(clippy::too_many_arguments)]
async fn query(
    config: &CtlConfig,
    scope: &str,
    member: Option<String>,
    role: Option<Role>,
    command: Option<String>,
    file: Option<PathBuf>,
    dbname: String,
    username: Option<String>,
) -> Result<()> {
    let sql = match (&command, &file) {
        (Some(_), Some(_)) => bail!("--command and --file are mutually exclusive"),
        (Some(command), None) => command.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Could not read query file '{}'", path.display()))?,
        (None, None) => bail!("You need to specify at least one of --file or --command"),
    };

    let dcs = get_dcs(config, scope)?;
    let cluster = dcs.get_cluster().await?;
    let selected = select_member(&cluster, member.as_deref(), role)?;
    let (host, port) = selected
        .conn_host_port()
        .ok_or_else(|| anyhow!("Member {} has no usable address", selected.name))?;

    let mut psql = ProcessCommand::new("psql");
    psql.arg("-tA")
        .arg("-h")
        .arg(&host)
        .arg("-p")
        .arg(port.to_string())
        .arg("-d")
        .arg(&dbname)
        .arg("-c")
        .arg(&sql);
    if let Some(user) = &username {
        psql.arg("-U").arg(user);
    }

    let output = psql.output().await.context("Could not run psql")?;
    if !output.status.success() {
        bail!(
            "Query failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    print!("{}", String::from_utf8_lossy(&output.stdout));
    Ok(())
}
