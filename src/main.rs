use anyhow::{Context, Result};
use clap::Parser;
use lyp::compiler::ProcessCompiler;
use lyp::remote::HttpIndex;
use lyp::runtime::RealRuntime;
use lyp::{Config, Engine, InstallOptions, Kind, ListEntry, SearchEntry, Target, UseOptions};
use std::path::PathBuf;

/// lyp - version and package manager for LilyPond
///
/// Installs and switches between lilypond versions, and installs the
/// packages a document declares with `\require`.
///
/// Examples:
///   lyp install lilypond@2.18.2 --default
///   lyp use 2.19
///   lyp compile score.ly
#[derive(Parser, Debug)]
#[command(author, version = env!("LYP_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// lyp home directory (defaults to ~/.lyp)
    #[arg(long = "home", env = "LYP_HOME", value_name = "PATH", global = true)]
    home: Option<PathBuf>,

    /// Package index URL
    #[arg(long = "index-url", env = "LYP_INDEX_URL", value_name = "URL", global = true)]
    index_url: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// List installed lilypond versions, or packages whose name matches PATTERN
    List {
        #[arg(value_name = "PATTERN")]
        pattern: Option<String>,
    },

    /// Search the index for lilypond versions or packages
    Search {
        /// `lilypond`, a version specifier, or a package name glob
        #[arg(value_name = "PATTERN")]
        pattern: String,
    },

    /// Install packages or versions of lilypond (`self` sets up lyp)
    Install {
        #[arg(value_name = "TARGET", required = true)]
        targets: Vec<String>,

        /// Make the installed lilypond the default version
        #[arg(short, long)]
        default: bool,
    },

    /// Switch the lilypond version of this session
    Use {
        #[arg(value_name = "VERSION")]
        version: String,

        /// Also make it the default version
        #[arg(short, long)]
        default: bool,
    },

    /// Uninstall packages or versions of lilypond (`self` removes lyp)
    Uninstall {
        #[arg(value_name = "TARGET", required = true)]
        targets: Vec<String>,
    },

    /// Resolve the document's packages and invoke lilypond on it
    Compile {
        /// Options passed to lilypond, followed by the document
        #[arg(
            value_name = "ARGS",
            required = true,
            trailing_var_arg = true,
            allow_hyphen_values = true
        )]
        args: Vec<String>,
    },
}

const LILYPOND_PREAMBLE: &str = "\nLilypond versions:\n";

const LILYPOND_LEGEND: &str = "
# => - current
# =* - current && default
#  * - default
";

fn lilypond_marker(entry: &ListEntry) -> &'static str {
    match (entry.current, entry.default) {
        (true, true) => "=* ",
        (true, false) => "=> ",
        (false, true) => " * ",
        (false, false) => "   ",
    }
}

fn format_lilypond_entry(entry: &ListEntry) -> String {
    let suffix = if entry.entity.is_system() { " (system)" } else { "" };
    format!("{}{}{}", lilypond_marker(entry), entry.entity.version(), suffix)
}

fn format_search_entry(found: &SearchEntry) -> String {
    let label = match found.entry.kind {
        Kind::Lilypond => found.entry.version.clone(),
        Kind::Package => format!("{}@{}", found.entry.name, found.entry.version),
    };
    if found.installed {
        format!("{} (installed)", label)
    } else if !found.entry.installable {
        format!("{} (not available for this platform)", label)
    } else {
        label
    }
}

/// Lilypond searches take a specifier; anything else is a package glob.
fn search_query(pattern: &str) -> (Kind, Option<String>) {
    match pattern.parse::<Target>() {
        Ok(Target::Lilypond(spec)) if spec.is_latest() => (Kind::Lilypond, None),
        Ok(Target::Lilypond(spec)) => (Kind::Lilypond, Some(spec.to_string())),
        _ => (Kind::Package, Some(pattern.to_string())),
    }
}

type LypEngine = Engine<RealRuntime, HttpIndex, ProcessCompiler>;

async fn run(engine: &LypEngine, command: Commands) -> Result<i32> {
    match command {
        Commands::List { pattern } => match pattern.as_deref() {
            None | Some("lilypond") => {
                println!("{}", LILYPOND_PREAMBLE);
                for entry in engine.list(Kind::Lilypond, None)? {
                    println!("{}", format_lilypond_entry(&entry));
                }
                println!("{}", LILYPOND_LEGEND);
            }
            Some(glob) => {
                for entry in engine.list(Kind::Package, Some(glob))? {
                    println!("{}", entry.entity.id());
                }
            }
        },
        Commands::Search { pattern } => {
            let (kind, query) = search_query(&pattern);
            for found in engine.search(kind, query.as_deref()).await? {
                println!("{}", format_search_entry(&found));
            }
        }
        Commands::Install { targets, default } => {
            let options = InstallOptions { default };
            for raw in &targets {
                let target: Target = raw.parse()?;
                if target == Target::Lyp {
                    engine.bootstrap()?;
                    println!("lyp is installed in {}", engine.config().home.display());
                    continue;
                }
                let entity = engine.install(&target, &options).await?;
                println!("Installed {}", entity.id());
            }
        }
        Commands::Use { version, default } => {
            let spec = match version.parse::<Target>()? {
                Target::Lilypond(spec) => spec,
                other => anyhow::bail!("'{}' is not a lilypond version", other),
            };
            let record = engine.use_version(&spec, &UseOptions { default })?;
            println!("Using version {}", record.version);
        }
        Commands::Uninstall { targets } => {
            for raw in &targets {
                let target: Target = raw.parse()?;
                if target == Target::Lyp {
                    engine.teardown()?;
                    println!("Removed {}", engine.config().home.display());
                    continue;
                }
                let entity = engine.uninstall(&target)?;
                println!("Uninstalled {}", entity.id());
            }
        }
        Commands::Compile { mut args } => {
            let document = PathBuf::from(args.pop().context("File not specified")?);
            return Ok(engine.compile(&document, &args).await?);
        }
    }
    Ok(0)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let runtime = RealRuntime;

    let config = Config::load(&runtime, cli.home, cli.index_url)?;
    let index = HttpIndex::new(&config.index_url, config.index_timeout, config.download_timeout)?;
    let engine = Engine::open(runtime, index, ProcessCompiler, config)?;

    let cancel = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, rolling back");
            cancel.cancel();
        }
    });

    let code = run(&engine, cli.command).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
