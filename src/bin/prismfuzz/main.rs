mod cli;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::Parser;

use prismfuzz::{
    analysis,
    bolts::cpu::CpuPool,
    config::{Config, DEACTIVATE_HYPERTHREAD},
    exec::spawn_workers,
    fuzz::{self, Channels},
    interrupt::InterruptMultiplexer,
    report, Error,
};

fn main() {
    env_logger::init();

    if let Err(err) = run(cli::Cli::parse()) {
        log::error!("fatal: {err}");
        eprintln!("fatal: {err}");
        std::process::exit(1);
    }
}

fn run(cli: cli::Cli) -> Result<(), Error> {
    println!("Prismfuzz start.");

    let mut put_cmdline = cli.cli.split_whitespace().map(String::from);
    let bin_path = put_cmdline
        .next()
        .map(PathBuf::from)
        .ok_or_else(|| Error::illegal_argument("the PUT command line is empty"))?;
    let put_args: Vec<String> = put_cmdline.collect();

    let seed_inputs = read_seeds(&cli.in_dir)?;
    println!("{} seed inputs loaded.", seed_inputs.len());

    // The output directory is recreated from scratch.
    if cli.out_dir.exists() {
        fs::remove_dir_all(&cli.out_dir)?;
    }
    fs::create_dir_all(&cli.out_dir)?;

    let config = Config::new(
        bin_path,
        put_args,
        cli.in_dir,
        cli.out_dir,
        cli.thread_n,
        Duration::from_millis(cli.timeout),
        cli.use_evo,
        cli.debug_child,
    );

    let interrupt = InterruptMultiplexer::install()?;
    let cpu_pool = Arc::new(CpuPool::new(DEACTIVATE_HYPERTHREAD));
    let channels = Channels::new();

    let workers = spawn_workers(&config, &cpu_pool, &interrupt, &channels.event_tx)?;
    println!("{} workers up.", workers.len());
    fuzz::spawn_crash_sink(channels.crash_rx.clone());

    let (mut seeds, global) =
        fuzz::fuzz_campaign(&config, &workers, &channels, &interrupt, seed_inputs);
    println!(
        "Campaign finished: {} seeds, union coverage {}.",
        seeds.len(),
        global.coverage()
    );

    // Refresh every seed's trace before the analysis reads them.
    analysis::collect_seed_traces(&workers[0], &channels.event_rx, &mut seeds);

    match analysis::project_all(&seeds) {
        Ok(projection) => report::export_all(&config.out_dir, &projection)?,
        Err(err) => log::warn!("skipping the projection reports: {err}"),
    }
    report::write_seed_files(&config.out_dir, &seeds)?;

    // Workers join here; each tears down its fork server and trace map.
    drop(workers);

    println!("Done. Results in {}.", config.out_dir.display());
    Ok(())
}

fn read_seeds(dir: &Path) -> Result<Vec<Vec<u8>>, Error> {
    let mut inputs = Vec::new();
    let entries = fs::read_dir(dir)
        .map_err(|err| Error::illegal_argument(format!("cannot read seed directory: {err}")))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        match fs::read(entry.path()) {
            Ok(input) => inputs.push(input),
            Err(err) => log::warn!("skipping seed {}: {err}", entry.path().display()),
        }
    }
    if inputs.is_empty() {
        return Err(Error::illegal_argument(format!(
            "no seed found in {}",
            dir.display()
        )));
    }
    Ok(inputs)
}
