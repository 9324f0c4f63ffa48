use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use topic_dispatch::resolver::{resolve, TopicSpec, TopicsConfig};
use topic_dispatch::DispatchConfig;

#[derive(Parser)]
#[command(name = "topic-dispatch")]
#[command(about = "Inspect and validate topic-dispatch configuration", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "DISPATCH_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a configuration file and report problems
    Validate {
        /// YAML or JSON configuration file
        #[arg(short, long, env = "DISPATCH_CONFIG")]
        config: PathBuf,
    },
    /// Show the topics a handler declaration resolves to
    Resolve {
        /// YAML or JSON configuration file
        #[arg(short, long, env = "DISPATCH_CONFIG")]
        config: PathBuf,

        /// Topic group name
        #[arg(short, long, conflicts_with = "topic")]
        group: Option<String>,

        /// Explicit topic, may be repeated
        #[arg(short, long)]
        topic: Vec<String>,
    },
}

fn init_logging(debug: bool, json: bool) {
    let level = if debug { tracing::Level::DEBUG } else { tracing::Level::WARN };
    if json {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load(path: &Path) -> topic_dispatch::Result<DispatchConfig> {
    let mut config = DispatchConfig::from_file(path)?;
    config.apply_env_overrides()?;
    Ok(config)
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Validate { config } => {
            let config = load(&config)?;
            config
                .validate()
                .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;

            let empty: Vec<&str> = config
                .topic_groups
                .iter()
                .filter(|(_, topics)| topics.is_empty())
                .map(|(name, _)| name.as_str())
                .collect();
            if !empty.is_empty() {
                anyhow::bail!("topic groups without topics: {}", empty.join(", "));
            }

            println!("configuration OK");
            println!("  brokers:         {}", config.brokers);
            println!("  group id:        {}", config.group_id);
            println!("  topic groups:    {}", config.topic_groups.len());
            println!("  fallback topics: {}", config.topics.join(", "));
            println!("  commit strategy: {}", config.commit_strategy);
            Ok(())
        }
        Command::Resolve {
            config,
            group,
            topic,
        } => {
            let config = load(&config)?;
            let spec = match group {
                Some(group) => TopicSpec::group(group),
                None if !topic.is_empty() => TopicSpec::direct(topic),
                None => TopicSpec::fallback(),
            };
            let topics = resolve(&spec, TopicsConfig::from(&config))?;
            for topic in topics {
                println!("{}", topic);
            }
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.json_logs);

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
