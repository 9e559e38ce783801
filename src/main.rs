use clap::{Arg, ArgAction, Command};
use std::error::Error;
use std::path::PathBuf;

use meshsync::config::Config;
use meshsync::layout::{self, Layout};
use meshsync::logging::*;
use meshsync::model::Model;
use meshsync::peer::PeerRegistry;
use meshsync::registry::DirectoryRegistry;

///////////////////////
// Utility functions //
///////////////////////

fn sync_root(dir: &str) -> Result<Layout, Box<dyn Error>> {
	let root = std::fs::canonicalize(dir).map_err(|e| format!("{}: {}", dir, e))?;
	if !layout::is_sync_root(&root) {
		return Err(format!("{} is not a synchronized directory", root.display()).into());
	}
	Ok(Layout::new(root))
}

async fn roots(config: &Config, matches: &clap::ArgMatches) -> Result<(), Box<dyn Error>> {
	let mut registry = DirectoryRegistry::load(&config.config_dir).await?;
	match matches.subcommand() {
		Some(("add", sub)) => {
			let dir = sub.get_one::<String>("dir").ok_or("roots add: directory argument required")?;
			let root = sync_root(dir)?.root().to_path_buf();
			if registry.add(root.clone()) {
				registry.save().await?;
				info!("Registered {}", root.display());
			} else {
				println!("{} is already registered", root.display());
			}
		}
		Some(("prune", _)) => {
			let gone = registry.prune();
			registry.save().await?;
			println!("Pruned {} roots", gone.len());
		}
		_ => {
			for root in registry.roots() {
				let marker = if layout::is_sync_root(root) { "" } else { " (missing)" };
				println!("{}{}", root.display(), marker);
			}
		}
	}
	Ok(())
}

async fn scan(dir: &str) -> Result<(), Box<dyn Error>> {
	let layout = sync_root(dir)?;
	let model = Model::scan(&layout).await?;
	for object in model.objects() {
		let kind = if object.directory { "d" } else { "f" };
		let path = if object.path.is_empty() { "." } else { object.path.as_str() };
		println!("{} {} {} {}", kind, object.identification, path, object.content);
	}
	Ok(())
}

async fn peers(dir: &str) -> Result<(), Box<dyn Error>> {
	let layout = sync_root(dir)?;
	let registry = PeerRegistry::load(&layout).await?;
	for peer in registry.iter() {
		let trust = if peer.trusted { "trusted" } else { "untrusted" };
		println!("{} {} {} {} ({})", peer.identification, peer.name, peer.protocol, peer.address, trust);
	}
	Ok(())
}

async fn status(dir: &str) -> Result<(), Box<dyn Error>> {
	let layout = sync_root(dir)?;
	let Some(model) = Model::load(&layout).await? else {
		println!("No model persisted in {}", layout.root().display());
		return Ok(());
	};
	for object in model.objects() {
		let state = model.state(&object.identification).map(|s| s.to_string()).unwrap_or_default();
		let shadow = if object.shadow { " shadow" } else { "" };
		println!("{:<16} {:<24} {}{} {}", object.identification, state, object.path, shadow, object.version);
	}
	println!("{} removed identifiers", model.tombstones().count());
	Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	let dir_arg = || Arg::new("dir").required(true);
	let matches = Command::new("meshsync")
		.version(env!("CARGO_PKG_VERSION"))
		.about("Peer-to-peer directory synchronization")
		.subcommand_required(true)
		.arg(
			Arg::new("config")
				.short('c')
				.long("config")
				.value_name("FILE")
				.global(true)
				.help("Config file (.toml, .json or .json5)"),
		)
		.arg(
			Arg::new("verbose")
				.short('v')
				.long("verbose")
				.action(ArgAction::SetTrue)
				.global(true)
				.help("Debug logging"),
		)
		.subcommand(
			Command::new("roots")
				.about("Manage the registry of synchronized directories")
				.subcommand(Command::new("list").about("List registered directories"))
				.subcommand(Command::new("add").about("Register a directory").arg(dir_arg()))
				.subcommand(Command::new("prune").about("Forget directories that are gone")),
		)
		.subcommand(Command::new("scan").about("Scan and print the object tree").arg(dir_arg()))
		.subcommand(Command::new("peers").about("List known peers").arg(dir_arg()))
		.subcommand(Command::new("status").about("Print the persisted model").arg(dir_arg()))
		.get_matches();

	let config_file = matches.get_one::<String>("config").map(PathBuf::from);
	let mut config = Config::load(config_file.as_deref())?;
	if matches.get_flag("verbose") {
		config.log_level = "debug".to_string();
	}
	init_tracing(&config.log_level);
	debug!("Configuration: {:?}", config);

	let dir = |m: &clap::ArgMatches| m.get_one::<String>("dir").cloned().unwrap_or_default();
	match matches.subcommand() {
		Some(("roots", sub)) => roots(&config, sub).await,
		Some(("scan", sub)) => scan(&dir(sub)).await,
		Some(("peers", sub)) => peers(&dir(sub)).await,
		Some(("status", sub)) => status(&dir(sub)).await,
		_ => Err("unknown subcommand".into()),
	}
}

// vim: ts=4
