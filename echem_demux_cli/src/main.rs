use clap::{value_parser, Arg, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use libechem_demux::config::Config;
use libechem_demux::sequencer::Sequencer;
use libechem_demux::simulated::{FaultPlan, SimulatedConnector};
use libechem_demux::worker_status::{BarColor, JobPhase, WorkerStatus};

fn make_template_config(path: &Path) {
    let config = Config::default();
    config
        .write_config_file(path)
        .expect("Failed to write template config file!");
}

fn bar_style(color: &BarColor) -> ProgressStyle {
    let color = match color {
        BarColor::CYAN => "cyan",
        BarColor::MAGENTA => "magenta",
        BarColor::RED => "red",
        BarColor::GREEN => "green",
    };
    ProgressStyle::with_template(&format!(
        "{{prefix:>18}} [{{bar:40.{color}}}] {{pos:>3}}% {{msg}}"
    ))
    .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn phase_message(status: &WorkerStatus) -> String {
    let phase = match status.phase {
        JobPhase::Connecting => "connecting",
        JobPhase::Streaming => "streaming",
        JobPhase::Backoff => "waiting to retry",
        JobPhase::Done => "done",
        JobPhase::Failed => "failed",
    };
    format!("{phase}, {} batches", status.batches_written)
}

fn fault_plan(matches: &ArgMatches) -> FaultPlan {
    FaultPlan {
        failed_connects: matches
            .get_one::<u32>("fail-connects")
            .copied()
            .unwrap_or(0),
        drop_after: matches.get_one::<u64>("fail-after").copied(),
        replay_technique: matches.get_one::<usize>("replay").copied(),
    }
}

fn cli() -> Command {
    Command::new("echem_demux_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .global(true)
                .help("Path to the config file"),
        )
        .arg(
            Arg::new("fail-connects")
                .long("fail-connects")
                .value_parser(value_parser!(u32))
                .help("Simulated instrument refuses this many connects"),
        )
        .arg(
            Arg::new("fail-after")
                .long("fail-after")
                .value_parser(value_parser!(u64))
                .help("Simulated instrument drops the first stream after this many samples"),
        )
        .arg(
            Arg::new("replay")
                .long("replay")
                .value_parser(value_parser!(usize))
                .help("Simulated instrument replays this technique index under the same run id"),
        )
        .arg(
            Arg::new("pace-ms")
                .long("pace-ms")
                .value_parser(value_parser!(u64))
                .help("Milliseconds between simulated samples"),
        )
}

fn main() {
    // Create a cli
    let matches = cli().get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    LogWrapper::new(pb_manager.clone(), logger)
        .try_init()
        .expect("Could not create logging/progress!");

    // Parse the cli
    let config_path = match matches.get_one::<String>("path") {
        Some(path) => PathBuf::from(path),
        None => {
            log::error!("A config path is required (-p/--path)");
            return;
        }
    };

    if let Some(("new", _)) = matches.subcommand() {
        log::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        make_template_config(&config_path);
        log::info!("Done.");
        return;
    }

    // Load our config
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    log::info!("Config successfully loaded.");
    log::info!("Data Path: {}", config.data_path.to_string_lossy());
    log::info!("Experiment: {} Run: {}", config.experiment_id, config.run_number);
    log::info!("Cell: {}", config.cell);
    log::info!("Instrument: {} channel {}", config.port, config.channel);
    log::info!(
        "Attempts: {} Retry Delay: {} s Restart Threshold: {} s",
        config.max_attempts,
        config.retry_delay_secs,
        config.restart_threshold
    );
    for job in config.jobs.iter() {
        log::info!(
            "Job {}: {} techniques into {}",
            job.name,
            job.techniques.len(),
            job.directory
        );
    }

    let mut connector = SimulatedConnector::new(fault_plan(&matches));
    if let Some(pace) = matches.get_one::<u64>("pace-ms") {
        connector = connector.with_sample_interval(Duration::from_millis(*pace));
    }

    // One bar per job
    let bars: Vec<ProgressBar> = config
        .jobs
        .iter()
        .map(|job| {
            let pb = pb_manager.add(ProgressBar::new(100));
            pb.set_style(bar_style(&BarColor::MAGENTA));
            pb.set_prefix(job.name.clone());
            pb.set_message("queued");
            pb
        })
        .collect();

    let mut sequencer = match Sequencer::new(config) {
        Ok(s) => s,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };

    // Spawn the task!
    let (tx, rx) = mpsc::channel::<WorkerStatus>();
    let handle = std::thread::spawn(move || sequencer.run(&mut connector, Some(&tx)));

    let mut colors: Vec<BarColor> = vec![BarColor::MAGENTA; bars.len()];
    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(status) => {
                if let Some(pb) = bars.get(status.job_index) {
                    let color = status.color();
                    if colors[status.job_index] != color {
                        pb.set_style(bar_style(&color));
                        colors[status.job_index] = color;
                    }
                    pb.set_position((status.progress * 100.0) as u64);
                    pb.set_message(phase_message(&status));
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => (),
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    match handle.join() {
        Ok(result) => match result {
            Ok(summaries) => {
                let batches: usize = summaries.iter().map(|s| s.run.batches.len()).sum();
                log::info!("Successfully wrote {batches} batches!");
            }
            Err(e) => log::error!("Experiment failed with error: {e}"),
        },
        Err(_) => log::error!("Failed to join experiment task!"),
    }

    for pb in bars {
        pb.finish();
    }

    log::info!("Done.");
}
