pub mod backend;
pub mod engine;
pub mod error;
pub mod model;
pub mod policy;
pub mod wire;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use crate::backend::memory::MemoryDirectory;
use crate::engine::alias::AliasPayload;
use crate::engine::{AllowAll, RecordListRequest, SearchService, ServicePaths};
use crate::model::types::{
    ATTR_ALIAS_DATA, Attribute, NodePath, RECTYPE_USER_ALIASES, RECTYPE_USERS, Record, SearchKind,
    SearchPolicy,
};
use crate::policy::config_file::ConfigSource;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "dirsearch",
    version,
    about = "Search-policy aggregation engine over pluggable directory nodes"
)]
pub struct Cli {
    /// Directory holding the search-node config files (defaults to the
    /// platform config dir)
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum CliKind {
    Auth,
    Contacts,
}

impl CliKind {
    fn search_kind(self) -> SearchKind {
        match self {
            CliKind::Auth => SearchKind::Authentication,
            CliKind::Contacts => SearchKind::Contacts,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum CliPolicy {
    Automatic,
    LocalOnly,
    Custom,
}

impl CliPolicy {
    fn search_policy(self) -> SearchPolicy {
        match self {
            CliPolicy::Automatic => SearchPolicy::Automatic,
            CliPolicy::LocalOnly => SearchPolicy::LocalOnly,
            CliPolicy::Custom => SearchPolicy::Custom,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print a search node's configured policy and custom path list
    Show {
        #[arg(value_enum)]
        kind: CliKind,
    },
    /// Set a search node's policy in its config file
    SetPolicy {
        #[arg(value_enum)]
        kind: CliKind,
        #[arg(value_enum)]
        policy: CliPolicy,
    },
    /// Replace a search node's custom path list in its config file
    SetCustomPaths {
        #[arg(value_enum)]
        kind: CliKind,
        /// Node paths in search order, e.g. /ldap/one
        paths: Vec<String>,
    },
    /// Run a query against an in-memory demo directory and print the
    /// decoded results (exercises the whole engine)
    Demo,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_dir = cli
        .config_dir
        .unwrap_or_else(|| ServicePaths::default_paths().config_dir);

    match cli.command {
        Commands::Show { kind } => show(&config_dir, kind.search_kind()),
        Commands::SetPolicy { kind, policy } => {
            set_policy(&config_dir, kind.search_kind(), policy.search_policy())
        }
        Commands::SetCustomPaths { kind, paths } => {
            set_custom_paths(&config_dir, kind.search_kind(), paths)
        }
        Commands::Demo => run_demo(),
    }
}

fn load_source(config_dir: &std::path::Path, kind: SearchKind) -> Result<ConfigSource> {
    let prefix = kind
        .config_prefix()
        .context("this search node keeps no config file")?;
    Ok(ConfigSource::load(config_dir, prefix))
}

fn show(config_dir: &std::path::Path, kind: SearchKind) -> Result<()> {
    let source = load_source(config_dir, kind)?;
    let config = source.config();
    println!("node:            {}", kind.node_name());
    println!("policy:          {}", config.policy);
    println!(
        "network default: {}",
        if config.network_defaults.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    if config.custom_paths.is_empty() {
        println!("custom paths:    (none)");
    } else {
        println!("custom paths:");
        for (i, path) in config.custom_paths.iter().enumerate() {
            println!("  {}. {path}", i + 1);
        }
    }
    Ok(())
}

fn set_policy(config_dir: &std::path::Path, kind: SearchKind, policy: SearchPolicy) -> Result<()> {
    let mut source = load_source(config_dir, kind)?;
    source.set_policy(policy);
    source.save().context("writing search node config")?;
    println!("{} policy set to {policy}", kind.node_name());
    Ok(())
}

fn set_custom_paths(
    config_dir: &std::path::Path,
    kind: SearchKind,
    paths: Vec<String>,
) -> Result<()> {
    let mut source = load_source(config_dir, kind)?;
    source.set_custom_paths(paths);
    source.save().context("writing search node config")?;
    println!("{} custom path list updated", kind.node_name());
    Ok(())
}

/// Build a small in-memory directory (local users, a hierarchical domain,
/// and an alias pointing across nodes), run a query through the service,
/// and print the decoded reply.
fn run_demo() -> Result<()> {
    let dir = Arc::new(MemoryDirectory::new());
    let local = dir.local_node();
    local.add_record(
        Record::new(RECTYPE_USERS, "amy")
            .with_attribute(Attribute::new("shell").with_value("/bin/zsh")),
    );
    local.add_record(
        Record::new(RECTYPE_USERS, "bo")
            .with_attribute(Attribute::new("shell").with_value("/bin/sh")),
    );

    let root = NodePath::parse("/domain/root");
    dir.set_hierarchy(Some(vec![root.clone()]));
    dir.node(&root)
        .expect("hierarchy node registered")
        .add_record(
            Record::new(RECTYPE_USERS, "carol")
                .with_attribute(Attribute::new("shell").with_value("/bin/bash")),
        );
    local.add_record(
        Record::new(RECTYPE_USER_ALIASES, "carol-alias").with_attribute(
            Attribute::new(ATTR_ALIAS_DATA).with_value(
                AliasPayload::new(vec!["carol".into()], RECTYPE_USERS, root).to_json(),
            ),
        ),
    );

    let scratch = tempfile::tempdir().context("creating demo scratch dir")?;
    let service = SearchService::new(dir, Arc::new(AllowAll), ServicePaths::under(scratch.path()));
    service.initialize()?;

    let node = service.open_virtual_node(SearchKind::Authentication.node_name(), 0)?;
    let reply = service.get_record_list(node, &RecordListRequest::all_of_types([RECTYPE_USERS]))?;
    println!("{} record(s):", reply.record_count);
    for index in 1..=reply.record_count {
        let rec = service.get_record_entry(&reply.buffer, index)?;
        println!("  [{}] {} {}", index, rec.rec_type, rec.name);
        for attr_index in 1..=u32::from(rec.attr_count) {
            let attr = service.get_attribute_entry(rec.attr_list_ref, &reply.buffer, attr_index)?;
            for value_index in 1..=u32::from(attr.value_count) {
                let value =
                    service.get_attribute_value(attr.value_list_ref, &reply.buffer, value_index)?;
                println!(
                    "        {} = {}",
                    attr.attr_type,
                    String::from_utf8_lossy(&value)
                );
            }
            service.close_attribute_value_list(attr.value_list_ref)?;
        }
        service.close_attribute_list(rec.attr_list_ref)?;
    }
    service.close_virtual_node(node)?;
    Ok(())
}
