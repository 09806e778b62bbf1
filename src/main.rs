//! EZCAD Automation - command-line front end.
//!
//! Drives the marking library through the command dispatcher, either by
//! launching `ezcad-bridge` per command (default) or by loading the library
//! into this process (`--in-process`).
//!
//! # Execution Flow
//!
//! 1. Load `EZCAD Automation.yaml` (plus `EZCAD_*` overrides) from the config directory
//! 2. Initialize logging: rolling file plus the live display on stderr
//! 3. Create tokio runtime
//! 4. Build the bridge client over the selected runner
//! 5. Run the subcommand, print its result on stdout
//!
//! Session commands (`update`, `mark`, `list`, `red`, `save`) act on the
//! document given with `--template`. `process` and `watch` edit one document
//! over many commands, so they load the library in-process whenever one is
//! configured.
//!
//! `watch` keeps running until Ctrl+C: changed data files in the watched
//! directory become queued batch jobs, changed EZD files switch the template.

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::TimeDelta;
use clap::{Parser, Subcommand};
use ezcad_automation::ffi::MarkEzdLibrary;
use ezcad_automation::logging::{self, DEFAULT_QUEUE_CAPACITY};
use ezcad_automation::models::RunnerMode;
use ezcad_automation::services::{
    self, BatchProcessor, BatchStatistics, BridgeClient, CommandRunner, DirectoryWatcher,
    EventForwarder, FilePatterns, InProcessRunner, Job, JobQueue, JobStatus, JobWorker,
    SubprocessRunner,
};
use ezcad_automation::{APP_NAME, AutomationConfig, ConfigManager, Dispatcher, VERSION};
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// How often finished jobs are pruned while watching.
const JOB_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Parser, Debug)]
#[command(name = "ezcad-automation", version, about = "Batch laser marking with EZCAD2")]
struct Cli {
    /// Configuration directory
    #[arg(long, default_value = "EZCAD Automation Data")]
    config: Utf8PathBuf,

    /// Path to the ezcad-bridge executable
    #[arg(long)]
    bridge: Option<Utf8PathBuf>,

    /// Load the marking library into this process instead of running ezcad-bridge
    #[arg(long)]
    in_process: bool,

    /// Path to MarkEzd.dll
    #[arg(long)]
    library: Option<Utf8PathBuf>,

    /// EZD document for session commands
    #[arg(long, short)]
    template: Option<Utf8PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Show bridge information
    Info,
    /// Open an EZD file
    Open {
        /// Path to the EZD file
        file: Utf8PathBuf,
    },
    /// Update a text entity
    Update {
        /// Entity name
        entity: String,
        /// New text
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Execute marking
    Mark {
        /// Entity to mark; everything when omitted
        entity: Option<String>,
    },
    /// List entities
    List,
    /// Position the red light pointer
    Red {
        /// X coordinate
        #[arg(allow_negative_numbers = true)]
        x: f64,
        /// Y coordinate
        #[arg(allow_negative_numbers = true)]
        y: f64,
    },
    /// Save the EZD file
    Save {
        /// Output file path
        output: Utf8PathBuf,
    },
    /// Test the integration with a template
    Test {
        /// Path to the EZD template
        template: Utf8PathBuf,
    },
    /// List entities in a template
    Entities {
        /// Path to the EZD template
        template: Utf8PathBuf,
    },
    /// Mark every row of a CSV file using a template
    Process {
        /// CSV file with a header row
        data: Utf8PathBuf,
        /// Path to the EZD template
        template: Utf8PathBuf,
        /// Save the resulting EZD file here
        #[arg(long)]
        output: Option<Utf8PathBuf>,
        /// JSON file mapping columns to entity names
        #[arg(long)]
        mappings: Option<Utf8PathBuf>,
    },
    /// Watch a directory and process changed files as queued jobs
    Watch {
        /// Directory to watch; defaults to monitoring.watch_directory
        directory: Option<Utf8PathBuf>,
        /// Watch subdirectories too
        #[arg(long)]
        recursive: bool,
        /// Save each data job's result here as <data file>.ezd
        #[arg(long)]
        output_dir: Option<Utf8PathBuf>,
        /// JSON file mapping columns to entity names
        #[arg(long)]
        mappings: Option<Utf8PathBuf>,
    },
    /// Manage configuration profiles
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
}

impl CliCommand {
    /// Whether the command edits one document over several bridge commands.
    fn spans_session(&self) -> bool {
        matches!(self, CliCommand::Process { .. } | CliCommand::Watch { .. })
    }
}

#[derive(Subcommand, Debug)]
enum ProfileAction {
    /// Save the current configuration as a profile
    Save { name: String },
    /// Make a saved profile the current configuration
    Load { name: String },
    /// List saved profiles
    List,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config_manager = ConfigManager::new(&cli.config)?;
    let mut config = config_manager.load_config()?;

    let debug = cli.debug || config.settings.debug_mode;
    let log_dir = Utf8PathBuf::from(&config.settings.log_dir);
    let (_guard, queue) = logging::setup_logging_with_queue(
        &log_dir,
        "ezcad_automation",
        debug,
        DEFAULT_QUEUE_CAPACITY,
    )?;
    // Dropped before the file guard; prints whatever is still queued.
    let _display = logging::spawn_log_display(queue, std::io::stderr());

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    if let CliCommand::Profile { action } = &cli.command {
        return run_profile_action(&config_manager, &config, action);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("ezcad-worker")
        .build()
        .context("Failed to create tokio runtime")?;

    let success = runtime.block_on(async {
        let runner = build_runner(&cli, &config)?;
        run_command(&cli, &config, BridgeClient::new(runner)).await
    })?;

    if let CliCommand::Process { data, template, .. } = &cli.command {
        remember_directories(&mut config, data, template);
        config_manager.save_config(&config)?;
    }

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn build_runner(cli: &Cli, config: &AutomationConfig) -> Result<Box<dyn CommandRunner>> {
    let library = cli.library.clone().or_else(|| config.markezd_dll_path());
    let mut mode = if cli.in_process {
        RunnerMode::InProcess
    } else {
        config.settings.runner
    };
    if cli.command.spans_session() {
        mode = mode.for_session_run(library.is_some());
        if mode == RunnerMode::Subprocess {
            tracing::warn!(
                "Each bridge command runs in a fresh process that reopens the template, \
                 so updated text is not kept for marking. Pass --in-process --library \
                 <MarkEzd.dll> or set paths.markezd_dll."
            );
        }
    }

    if mode == RunnerMode::InProcess {
        let library_path = library
            .context("The in-process runner needs --library or paths.markezd_dll in the config")?;
        let library = MarkEzdLibrary::load(&library_path)
            .with_context(|| format!("Failed to load marking library: {}", library_path))?;
        tracing::info!("Using in-process marking library: {}", library_path);

        let dispatcher = Dispatcher::new(library, Vec::new())
            .with_library_path(library_path)
            .with_fly_mark(config.settings.fly_mark);
        return Ok(Box::new(InProcessRunner::new(dispatcher)));
    }

    let configured = cli.bridge.clone().or_else(|| config.bridge_exe_path());
    let executable = services::locate_bridge_executable(configured.as_deref())?;
    Ok(Box::new(
        SubprocessRunner::new(executable)
            .with_library(library)
            .with_timeout(config.command_timeout()),
    ))
}

async fn run_command<R: CommandRunner + 'static>(
    cli: &Cli,
    config: &AutomationConfig,
    mut client: BridgeClient<R>,
) -> Result<bool> {
    match &cli.command {
        CliCommand::Info => {
            println!("{}", client.info().await?.trim_end());
            Ok(true)
        }
        CliCommand::Open { file } => {
            let opened = client.open(file).await?;
            print_result("Open", opened);
            Ok(opened)
        }
        CliCommand::Update { entity, text } => {
            open_template(cli, &mut client).await?;
            let updated = client.update_text(entity, &text.join(" ")).await?;
            print_result("Update", updated);
            Ok(updated)
        }
        CliCommand::Mark { entity } => {
            open_template(cli, &mut client).await?;
            let marked = client.mark(entity.as_deref()).await?;
            print_result("Mark", marked);
            Ok(marked)
        }
        CliCommand::List => {
            open_template(cli, &mut client).await?;
            let entities = client.list_entity_descriptors().await?;
            println!("Found {} entities:", entities.len());
            for entity in &entities {
                match entity.type_code {
                    Some(code) => println!("  {} (Type: {})", entity.name, code),
                    None => println!("  {}", entity.name),
                }
            }
            Ok(true)
        }
        CliCommand::Red { x, y } => {
            open_template(cli, &mut client).await?;
            let positioned = client.red_light(*x, *y).await?;
            print_result("Red light", positioned);
            Ok(positioned)
        }
        CliCommand::Save { output } => {
            open_template(cli, &mut client).await?;
            let saved = client.save(output).await?;
            print_result("Save", saved);
            Ok(saved)
        }
        CliCommand::Test { template } => {
            let passed = services::test_integration(&mut client, template).await?;
            print_result("Test", passed);
            Ok(passed)
        }
        CliCommand::Entities { template } => {
            let entities = services::list_entities_in_template(&mut client, template).await?;
            println!("Found {} entities:", entities.len());
            for entity in &entities {
                println!("  {}", entity);
            }
            Ok(!entities.is_empty())
        }
        CliCommand::Process {
            data,
            template,
            output,
            mappings,
        } => {
            let mappings = mappings
                .as_deref()
                .map(services::load_mappings)
                .transpose()?;
            let records = services::load_records_csv(data, mappings.as_ref())?;
            tracing::info!("Processing {} rows from {}", records.len(), data);

            let mut processor = BatchProcessor::new(client);
            let stats = processor
                .process(template, &records, output.as_deref())
                .await?;
            print_summary(&stats);
            Ok(stats.errors == 0 && stats.saved != Some(false))
        }
        CliCommand::Watch {
            directory,
            recursive,
            output_dir,
            mappings,
        } => {
            let settings = WatchSettings {
                directory: directory
                    .clone()
                    .or_else(|| config.monitoring.watch_directory_path())
                    .context("No directory to watch: pass one or set monitoring.watch_directory")?,
                recursive: *recursive || config.monitoring.recursive,
                template: cli
                    .template
                    .clone()
                    .or_else(|| config.monitoring.template_path()),
                output_dir: output_dir
                    .clone()
                    .or_else(|| config.monitoring.output_dir_path()),
                mappings: mappings.clone(),
            };
            run_watch(config, settings, client).await
        }
        CliCommand::Profile { .. } => bail!("Profile actions do not use the bridge"),
    }
}

/// Open `--template` as the current document for a session command.
async fn open_template<R: CommandRunner>(cli: &Cli, client: &mut BridgeClient<R>) -> Result<()> {
    let Some(template) = &cli.template else {
        bail!("This command needs an EZD document: pass --template <file.ezd>");
    };
    if !client.open(template).await? {
        bail!("Failed to open EZD file: {}", template);
    }
    Ok(())
}

struct WatchSettings {
    directory: Utf8PathBuf,
    recursive: bool,
    template: Option<Utf8PathBuf>,
    output_dir: Option<Utf8PathBuf>,
    mappings: Option<Utf8PathBuf>,
}

/// Watch a directory until Ctrl+C, running changed files through the job
/// queue. Succeeds when no job failed.
async fn run_watch<R: CommandRunner + 'static>(
    config: &AutomationConfig,
    settings: WatchSettings,
    client: BridgeClient<R>,
) -> Result<bool> {
    let monitoring = &config.monitoring;
    let mappings = settings
        .mappings
        .as_deref()
        .map(services::load_mappings)
        .transpose()?;
    if settings.template.is_none() {
        tracing::warn!(
            "No template yet; data jobs fail until an EZD file changes in {}",
            settings.directory
        );
    }

    let queue = JobQueue::new();
    let (event_tx, event_rx) = mpsc::channel(64);
    let forwarder = EventForwarder::new(
        FilePatterns::from_settings(monitoring),
        monitoring.debounce(),
        event_tx,
    );
    let watcher = DirectoryWatcher::start(&settings.directory, settings.recursive, forwarder)?;
    let feed = tokio::spawn(services::feed_jobs(queue.clone(), event_rx));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = JobWorker::new(BatchProcessor::new(client))
        .with_template(settings.template)
        .with_mappings(mappings)
        .with_output_dir(settings.output_dir);
    let worker = tokio::spawn(worker.run(queue.clone(), shutdown_rx));

    println!("Watching {} (Ctrl+C to stop)", settings.directory);
    let max_age = TimeDelta::hours(monitoring.max_job_age_hours.min(876_000) as i64);
    let mut cleanup = tokio::time::interval(JOB_CLEANUP_INTERVAL);
    cleanup.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                break;
            }
            _ = cleanup.tick() => {
                queue.clear_finished(max_age);
            }
        }
    }

    tracing::info!("Stopping directory watch");
    drop(watcher);
    let _ = shutdown_tx.send(true);
    worker.await.context("Job worker stopped unexpectedly")?;
    feed.await.context("Job feed stopped unexpectedly")?;

    let jobs = queue.jobs();
    print_jobs(&jobs);
    Ok(jobs.iter().all(|job| job.status != JobStatus::Failed))
}

fn run_profile_action(
    config_manager: &ConfigManager,
    config: &AutomationConfig,
    action: &ProfileAction,
) -> Result<ExitCode> {
    match action {
        ProfileAction::Save { name } => {
            let path = config_manager.save_profile(name, config)?;
            println!("Saved profile '{}' to {}", name, path);
        }
        ProfileAction::Load { name } => {
            config_manager.load_profile(name)?;
            println!("Loaded profile '{}'", name);
        }
        ProfileAction::List => {
            let profiles = config_manager.list_profiles()?;
            if profiles.is_empty() {
                println!("No saved profiles");
            }
            for profile in profiles {
                println!("{}", profile);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn remember_directories(config: &mut AutomationConfig, data: &Utf8Path, template: &Utf8Path) {
    if let Some(dir) = template.parent().filter(|dir| !dir.as_str().is_empty()) {
        config.paths.last_template_dir = dir.to_string();
    }
    if let Some(dir) = data.parent().filter(|dir| !dir.as_str().is_empty()) {
        config.paths.last_data_dir = dir.to_string();
    }
}

fn print_result(operation: &str, success: bool) {
    println!(
        "{} result: {}",
        operation,
        if success { "Success" } else { "Failed" }
    );
}

fn print_jobs(jobs: &[Job]) {
    println!("Jobs: {}", jobs.len());
    for job in jobs {
        let detail = match (&job.result, &job.error) {
            (Some(result), _) => result.to_string(),
            (None, Some(error)) => error.clone(),
            (None, None) => String::new(),
        };
        println!("  [{}] {} {} {}", job.id, job.status, job.path, detail);
    }
}

fn print_summary(stats: &BatchStatistics) {
    println!("Processed {}/{} items", stats.success, stats.total);
    println!("Errors: {}", stats.errors);
    println!("Duration: {:.2} seconds", stats.duration().as_secs_f64());
    if let Some(saved) = stats.saved {
        print_result("Save", saved);
    }
    for record in stats.records.iter().filter(|r| !r.status.is_success()) {
        println!("  {}: {:?}", record.id, record.status);
    }
}
