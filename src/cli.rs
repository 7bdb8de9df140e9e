//! Command Line Interface definitions for spiderexpress.
//!
//! Three verbs: `create` emits a project file, `start` runs a crawl to its
//! terminal state, `list` prints the registered plug-ins. Every fatal error
//! surfaces as a single-line summary and a non-zero exit code.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::builder::SpiderBuilder;
use crate::plugin::PluginRegistry;

/// Traverse the deserts of the internet.
#[derive(Parser)]
#[command(name = "spiderexpress", version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new configuration.
    Create {
        /// Where to write the project file.
        config: PathBuf,
        /// Prompt for the basic settings instead of emitting defaults.
        #[arg(long, conflicts_with = "non_interactive")]
        interactive: bool,
        #[arg(long)]
        non_interactive: bool,
    },
    /// Start a job.
    Start {
        /// The project file to run.
        config: PathBuf,
        /// Raise the log level (-v: debug, -vv: trace).
        #[arg(short, long, action = clap::ArgAction::Count)]
        verbose: u8,
        /// Write logs to a file instead of stderr.
        #[arg(short, long)]
        logfile: Option<PathBuf>,
    },
    /// List all registered plug-ins.
    List,
}

const CONFIG_TEMPLATE: &str = r#"# spiderexpress project file
project_name: {project_name}
# empty db_url runs against an in-memory store
db_url: {db_url}
max_iteration: {max_iteration}
batch_size: 150
empty_seeds: {empty_seeds}
{seed_section}
layers:
  default:
    connector:
      csv:
        edge_list_location: edges.csv
        mode: out
    routers:
      - source: source
        target:
          - field: target
    sampler:
      random:
        n: 10
"#;

fn prompt(question: &str, default: &str) -> anyhow::Result<String> {
    print!("{question} [{default}]: ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    let answer = answer.trim();
    Ok(if answer.is_empty() {
        default.to_string()
    } else {
        answer.to_string()
    })
}

fn create_configuration(config: &PathBuf, interactive: bool) -> anyhow::Result<()> {
    let (project_name, db_url, max_iteration, empty_seeds, seed_file) = if interactive {
        (
            prompt("Name of your project?", "spider")?,
            prompt("URL of your database?", "spider.db")?,
            prompt("How many iterations should be done?", "10000")?,
            prompt("What should happen if seeds are empty? (stop/continue)", "continue")?,
            prompt("Do you wish to read a file for seeds? (path or empty)", "")?,
        )
    } else {
        (
            "spider".to_string(),
            "spider.db".to_string(),
            "10000".to_string(),
            "continue".to_string(),
            String::new(),
        )
    };

    let seed_section = if seed_file.is_empty() {
        "seeds: []".to_string()
    } else {
        format!("seed_file: {seed_file}")
    };
    let rendered = CONFIG_TEMPLATE
        .replace("{project_name}", &project_name)
        .replace("{db_url}", &db_url)
        .replace("{max_iteration}", &max_iteration)
        .replace("{empty_seeds}", &empty_seeds)
        .replace("{seed_section}", &seed_section);

    std::fs::write(config, rendered)
        .with_context(|| format!("cannot write {}", config.display()))?;
    println!("wrote {}", config.display());
    Ok(())
}

fn init_logging(verbose: u8, logfile: Option<&PathBuf>) -> anyhow::Result<()> {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    match logfile {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("cannot open logfile {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

/// Parses the command line and runs the selected verb.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Create {
            config,
            interactive,
            non_interactive: _,
        } => create_configuration(&config, interactive),
        Command::Start {
            config,
            verbose,
            logfile,
        } => {
            init_logging(verbose, logfile.as_ref())?;
            let spider = SpiderBuilder::new()
                .with_configuration_file(&config)?
                .build()?;
            let stats = spider.run().await?;
            println!("{stats}");
            Ok(())
        }
        Command::List => {
            let registry = PluginRegistry::with_builtins();
            println!("--- connectors ---");
            for name in registry.connector_names() {
                println!("{name}");
            }
            println!("--- strategies ---");
            for name in registry.strategy_names() {
                println!("{name}");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration_template_is_valid_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.yml");
        create_configuration(&path, false).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let configuration: crate::config::Configuration = serde_yaml::from_str(&text).unwrap();
        configuration.validate().unwrap();
        assert_eq!(configuration.project_name, "spider");
        assert_eq!(configuration.layers.len(), 1);
    }

    #[test]
    fn cli_parses_the_three_verbs() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
        assert!(Cli::try_parse_from(["spiderexpress", "create", "p.yml", "--interactive"]).is_ok());
        assert!(Cli::try_parse_from(["spiderexpress", "start", "p.yml", "-vv"]).is_ok());
        assert!(Cli::try_parse_from(["spiderexpress", "list"]).is_ok());
    }
}
