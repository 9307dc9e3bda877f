use std::{fs, process::ExitCode, thread};

use env_logger::Env;
use log::{debug, error, info};
use serde::Serialize;

use msi_cache::{
    coherence,
    engine::StatsReport,
    error::TraceError,
    harness::AckingCoordinator,
    trace::Trace,
    CacheLookupEngine, Config, Error, Outcome, RequestSequencer, Response,
};

#[derive(Serialize)]
struct Summary {
    requests: u64,
    acks: u64,
    aborts: u64,
    coordinator_messages: u64,
    injected_aborts: u64,
    controllers: Vec<StatsReport>,
}

fn main() -> ExitCode {
    let env = Env::default()
        .filter_or("MSI_LOG", "info")
        .write_style_or("MSI_LOG_STYLE", "auto");
    env_logger::init_from_env(env);

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Error> {
    let mut args = pico_args::Arguments::from_env();
    let abort_rate: f64 = args.opt_value_from_str("--abort-rate")?.unwrap_or(0.0);
    let seed: Option<u64> = args.opt_value_from_str("--seed")?;
    let req_per_block: usize = args
        .opt_value_from_str("--buffer-size")?
        .unwrap_or(1024);
    let blocks_per_queue: usize = args.opt_value_from_str("--queue-size")?.unwrap_or(32);
    let stats_path: Option<String> = args.opt_value_from_str("--json")?;

    let config = if let Some(config_str) = args.opt_value_from_str::<_, String>("--config")? {
        Config::from_json(&config_str)?
    } else if let Some(config_path) = args.opt_value_from_str::<_, String>("-p")? {
        Config::from_path(config_path)?
    } else {
        Config::default()
    };
    let geometry = config.geometry()?;
    let trace_path: String = args.value_from_str("-t")?;

    info!(
        "{} controllers, {} lines of {} bytes",
        config.processors,
        geometry.lines(),
        geometry.block_size()
    );

    let (link, clients) = coherence::fabric(config.processors, config.response_timeout());
    let mut coordinator =
        AckingCoordinator::new(geometry.words_per_line, abort_rate, seed);
    let coordinator_thread = thread::spawn(move || {
        link.serve(|msg, _| coordinator.respond(msg));
        coordinator
    });

    let (egress, responses) = crossbeam::channel::unbounded::<Response>();
    let sequencers = clients
        .into_iter()
        .map(|client| {
            let engine = CacheLookupEngine::new(client.processor(), geometry, client);
            RequestSequencer::spawn(engine, config.queue_depth, egress.clone())
        })
        .collect::<Result<Vec<_>, _>>()?;
    drop(egress);

    let collector = thread::spawn(move || {
        let (mut acks, mut aborts) = (0u64, 0u64);
        for response in responses {
            match response.outcome {
                Outcome::Ack => acks += 1,
                Outcome::TxAbort => aborts += 1,
            }
            if let Some(value) = response.value {
                debug!("{} = {value}", response.request);
            }
        }
        (acks, aborts)
    });

    let trace = Trace::read(trace_path.into(), req_per_block, blocks_per_queue)?;
    let mut dispatched = 0u64;
    'dispatch: for block in trace.rec.iter() {
        for request in block? {
            let sequencer = sequencers.get(request.processor as usize).ok_or(
                TraceError::UnknownProcessor {
                    index: dispatched,
                    processor: request.processor,
                },
            )?;
            if sequencer.submit(request).is_err() {
                // the worker's own error is reported by finish
                break 'dispatch;
            }
            dispatched += 1;
        }
    }

    let engines = sequencers
        .into_iter()
        .map(RequestSequencer::finish)
        .collect::<Result<Vec<_>, _>>()?;
    let controllers = engines.iter().map(|e| e.make_stats()).collect::<Vec<_>>();
    drop(engines);

    let (acks, aborts) = collector
        .join()
        .map_err(|_| Error::WorkerPanicked("collector".into()))?;
    let coordinator = coordinator_thread
        .join()
        .map_err(|_| Error::WorkerPanicked("coordinator".into()))?;

    println!("Ran {dispatched} requests: {acks} ACK, {aborts} TX_ABORT");
    let summary = Summary {
        requests: dispatched,
        acks,
        aborts,
        coordinator_messages: coordinator.served,
        injected_aborts: coordinator.aborts,
        controllers,
    };
    if let Some(stats_path) = stats_path {
        let stats_file = fs::File::create(stats_path)?;
        serde_json::to_writer_pretty(stats_file, &summary).map_err(std::io::Error::from)?;
    }
    Ok(())
}
