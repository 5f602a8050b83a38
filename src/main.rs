use anyhow::Context;
use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{error, info};

use cluster_batcher::{
    cache::ArtifactCache,
    config::{Options, cli::Cli},
    graph::Graph,
    observability,
    pipeline::{PreparedSplit, load_graph, prepare_all, run_name},
};

fn main() -> anyhow::Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("unnamed");
        let message = panic_info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| {
                panic_info
                    .payload()
                    .downcast_ref::<String>()
                    .map(String::as_str)
            })
            .unwrap_or("unknown panic payload");

        if let Some(location) = panic_info.location() {
            error!(
                thread = thread_name,
                file = location.file(),
                line = location.line(),
                column = location.column(),
                message,
                "panic occurred"
            );
        } else {
            error!(
                thread = thread_name,
                message, "panic occurred without location information"
            );
        }
    }));

    let (cli, overrides) =
        Cli::parse_with_overrides(std::env::args()).context("failed to parse command line")?;
    observability::tracing::init(cli.log_format).context("failed to initialize tracing")?;

    let threads = cli.threads.unwrap_or_else(num_cpus::get).max(1);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .context("failed to build the clustering thread pool")?;

    let options = Options::load(&cli.config, &overrides)
        .with_context(|| format!("failed to load configuration {}", cli.config.display()))?
        .with_cache_flags(cli.cache_flags());
    let run = run_name(&options, Utc::now());
    info!(
        run = %run,
        dataset = %options.dataset_name,
        overrides = overrides.len(),
        threads,
        "starting run"
    );

    let cache = ArtifactCache::new(options.cache_dir());
    let graph = load_graph(&options, &cache).context("failed to load dataset")?;
    let splits = prepare_all(&options, &graph, &cache).context("failed to prepare splits")?;

    if cli.prepare_only {
        info!(run = %run, splits = splits.len(), "splits prepared, skipping batch assembly");
        return Ok(());
    }
    for split in &splits {
        stream_split(&cli, &options, &graph, split)?;
    }
    info!(run = %run, "run finished");
    Ok(())
}

fn stream_split(
    cli: &Cli,
    options: &Options,
    graph: &Graph,
    split: &PreparedSplit,
) -> anyhow::Result<()> {
    let assembler = split
        .assembler(graph)
        .and_then(|assembler| assembler.shard(cli.worker_index, cli.worker_count))
        .with_context(|| format!("failed to build the {} batch assembler", split.kind()))?;
    let epochs = cli.stream_epochs.unwrap_or_else(|| split.epochs());
    let steps = epochs * assembler.steps_per_epoch();
    let mut rng = StdRng::seed_from_u64(options.seed);

    info!(
        split = %split.kind(),
        epochs,
        batches_per_epoch = assembler.batches_per_epoch(),
        worker_index = cli.worker_index,
        worker_count = cli.worker_count,
        "streaming batches"
    );
    for batch in assembler.stream(&mut rng).take(steps) {
        let adjacency_shape = if split.use_sparse_representation() {
            (batch.num_nodes(), batch.num_nodes())
        } else {
            batch.dense_adjacency().dim()
        };
        info!(
            split = %split.kind(),
            epoch = batch.epoch,
            step = batch.step,
            clusters = ?batch.cluster_ids,
            nodes = batch.num_real_nodes(),
            padding = batch.num_padding_nodes,
            entries = batch.num_entries(),
            masked = batch.num_masked_nodes(),
            pruned_nodes = batch.pruned_nodes,
            pruned_edges = batch.pruned_edges,
            adjacency_shape = ?adjacency_shape,
            "batch assembled"
        );
    }
    Ok(())
}
