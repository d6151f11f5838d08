//! `depup` command-line front end
//!
//! Reads topology files from disk and prints validation results, structural
//! diffs and migration plans. Nothing here talks to a live deployment; plans
//! are computed against a live state derived from the old topology, adjusted
//! with `--live node=count`.

#![warn(unreachable_pub)]

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use depup_planner::{LiveNode, LiveState, MigrationPlan, Planner};
use depup_topology::{diff, Change, Topology};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Node version assumed for nodes read from a topology file
const FILE_NODE_VERSION: u64 = 1;

/// Build the `depup` command line
#[must_use]
pub fn command() -> Command {
    Command::new("depup")
        .version(VERSION)
        .about("Inspect deployment topology updates")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("check")
                .about("Validate a topology file")
                .arg(file_arg("file", "Topology file (.json, .yaml or .yml)")),
        )
        .subcommand(
            Command::new("diff")
                .about("List the changes between two topologies")
                .arg(file_arg("old", "Current topology"))
                .arg(file_arg("new", "Candidate topology"))
                .arg(json_arg()),
        )
        .subcommand(
            Command::new("plan")
                .about("Print the ordered migration plan between two topologies")
                .arg(file_arg("old", "Current topology"))
                .arg(file_arg("new", "Candidate topology"))
                .arg(
                    Arg::new("live")
                        .long("live")
                        .value_name("NODE=COUNT")
                        .help("Override the live instance count of a node")
                        .action(ArgAction::Append)
                        .value_parser(parse_live),
                )
                .arg(json_arg()),
        )
}

fn file_arg(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .help(help)
        .required(true)
        .value_parser(value_parser!(PathBuf))
}

fn json_arg() -> Arg {
    Arg::new("json")
        .long("json")
        .help("Print JSON instead of text")
        .action(ArgAction::SetTrue)
}

/// Parse a `node=count` live-state override
///
/// # Errors
///
/// Returns a message when the value has no `=`, an empty node id, or a count
/// that is not a non-negative integer.
pub fn parse_live(raw: &str) -> Result<(String, u32), String> {
    let (node, count) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NODE=COUNT, got '{raw}'"))?;
    let node = node.trim();
    if node.is_empty() {
        return Err(format!("missing node id in '{raw}'"));
    }
    let count = count
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("invalid instance count in '{raw}': {e}"))?;
    Ok((node.to_string(), count))
}

/// Run the subcommand selected in `matches` and return what to print
///
/// # Errors
///
/// Unreadable files, invalid topologies and unsupported changes.
pub fn run(matches: &ArgMatches) -> Result<String> {
    match matches.subcommand() {
        Some(("check", m)) => check(path_arg(m, "file")?),
        Some(("diff", m)) => diff_files(path_arg(m, "old")?, path_arg(m, "new")?, m.get_flag("json")),
        Some(("plan", m)) => {
            let live: Vec<(String, u32)> = m
                .get_many::<(String, u32)>("live")
                .into_iter()
                .flatten()
                .cloned()
                .collect();
            plan_files(path_arg(m, "old")?, path_arg(m, "new")?, &live, m.get_flag("json"))
        }
        Some((other, _)) => bail!("unknown command '{other}'"),
        None => bail!("no command given"),
    }
}

fn path_arg<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a Path> {
    matches
        .get_one::<PathBuf>(name)
        .map(PathBuf::as_path)
        .with_context(|| format!("missing argument <{name}>"))
}

/// Load a topology, choosing the parser by file extension
///
/// # Errors
///
/// Unknown extensions, I/O failures and validation errors.
pub fn load_topology(path: &Path) -> Result<Topology> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let topology = match extension.as_deref() {
        Some("json") => Topology::from_json(&text),
        Some("yaml" | "yml") => Topology::from_yaml(&text),
        _ => bail!(
            "unsupported topology format for {} (expected .json, .yaml or .yml)",
            path.display()
        ),
    }
    .with_context(|| format!("loading {}", path.display()))?;
    debug!(path = %path.display(), nodes = topology.nodes().len(), "loaded topology");
    Ok(topology)
}

/// `depup check <file>`
///
/// # Errors
///
/// See [`load_topology`].
pub fn check(path: &Path) -> Result<String> {
    let topology = load_topology(path)?;
    Ok(format!(
        "{}: ok ({} nodes, {} relationships, hash {})",
        path.display(),
        topology.nodes().len(),
        topology.relationship_edges().len(),
        topology.hash().short()
    ))
}

/// `depup diff <old> <new>`
///
/// # Errors
///
/// See [`load_topology`].
pub fn diff_files(old: &Path, new: &Path, json: bool) -> Result<String> {
    let changes = diff(&load_topology(old)?, &load_topology(new)?);
    if json {
        return Ok(serde_json::to_string_pretty(&changes)?);
    }
    Ok(render_changes(&changes))
}

fn render_changes(changes: &[Change]) -> String {
    if changes.is_empty() {
        return "no changes".to_string();
    }
    changes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// `depup plan <old> <new> [--live node=count]...`
///
/// # Errors
///
/// Load failures, overrides naming nodes absent from `old`, and planning
/// errors such as node type changes.
pub fn plan_files(old: &Path, new: &Path, live: &[(String, u32)], json: bool) -> Result<String> {
    let old = load_topology(old)?;
    let new = load_topology(new)?;
    let live = live_state(&old, live)?;
    let plan = Planner::new()
        .plan(&diff(&old, &new), &live)
        .context("planning update")?;
    if json {
        return Ok(serde_json::to_string_pretty(&plan)?);
    }
    Ok(render_plan(&plan))
}

/// Live state implied by `topology`, with `overrides` applied on top
///
/// # Errors
///
/// An override names a node the topology does not declare.
pub fn live_state(topology: &Topology, overrides: &[(String, u32)]) -> Result<LiveState> {
    let mut live: LiveState = topology
        .nodes()
        .iter()
        .map(|(id, spec)| {
            (
                id.clone(),
                LiveNode::new(FILE_NODE_VERSION, spec.instances.target()),
            )
        })
        .collect();
    for (node, count) in overrides {
        match live.get_mut(node) {
            Some(entry) => entry.live_instances = *count,
            None => bail!("--live names unknown node '{node}'"),
        }
    }
    Ok(live)
}

fn render_plan(plan: &MigrationPlan) -> String {
    if plan.is_empty() {
        return "no changes required".to_string();
    }
    let mut out = String::new();
    for (index, step) in plan.steps.iter().enumerate() {
        let _ = writeln!(out, "{:>3}. {step}", index + 1);
    }
    if !plan.instance_deltas.is_empty() {
        out.push_str("instances:\n");
        for (node, delta) in &plan.instance_deltas {
            let _ = writeln!(
                out,
                "  {node}: {} -> {} ({:+})",
                delta.current,
                delta.target,
                delta.delta()
            );
        }
    }
    out.truncate(out.trim_end().len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_overrides_parse() {
        assert_eq!(parse_live("web=3"), Ok(("web".to_string(), 3)));
        assert_eq!(parse_live(" db = 0 "), Ok(("db".to_string(), 0)));
        assert!(parse_live("web").is_err());
        assert!(parse_live("=2").is_err());
        assert!(parse_live("web=-1").is_err());
    }

    #[test]
    fn command_definition_is_consistent() {
        command().debug_assert();
    }

    #[test]
    fn unknown_live_node_is_an_error() {
        let topology = Topology::from_json(r#"{"nodes": {"web": {"type": "app"}}}"#).unwrap();
        let err = live_state(&topology, &[("ghost".to_string(), 1)]).unwrap_err();
        assert!(err.to_string().contains("ghost"));

        let live = live_state(&topology, &[("web".to_string(), 4)]).unwrap();
        assert_eq!(live["web"], LiveNode::new(FILE_NODE_VERSION, 4));
    }
}
