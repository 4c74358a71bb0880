use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use frame_gallery::broadcast::EventBroadcaster;
use frame_gallery::cleanup::DeviceCleaner;
use frame_gallery::config::{Configuration, DeviceKind};
use frame_gallery::device::scripted::ScriptedDevice;
use frame_gallery::device::websocket::WebSocketTransport;
use frame_gallery::device::{DeviceLink, FrameTransport};
use frame_gallery::filter::FilterEvaluator;
use frame_gallery::library::{ImageStore, LibraryIndex};
use frame_gallery::scheduler::{SchedulerDeps, SlideshowScheduler, choose_next};
use frame_gallery::settings::{JsonSettingsStore, SettingsStore};
use frame_gallery::upload::{JsonUploadCache, UploadCoordinator};
use frame_gallery::web::{self, ApiState};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "frame-gallery",
    version,
    about = "Drives a networked picture frame from a local photo library"
)]
struct Args {
    /// Path to YAML config
    #[arg(value_name = "CONFIG")]
    config: PathBuf,
    /// Raise this crate's log level (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
    /// Print the next N slideshow picks without touching the device
    #[arg(long = "selection-dry-run", value_name = "ITERATIONS")]
    selection_dry_run: Option<usize>,
    /// Deterministic RNG seed for random selection (dry-run and live)
    #[arg(long = "selection-seed", value_name = "SEED")]
    selection_seed: Option<u64>,
}

fn init_tracing(verbosity: u8) -> Result<()> {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let level = match verbosity {
        0 => None,
        1 => Some("debug"),
        _ => Some("trace"),
    };
    if let Some(level) = level {
        let directive = format!("frame_gallery={level}")
            .parse()
            .context("invalid log directive")?;
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        config,
        verbose,
        selection_dry_run,
        selection_seed,
    } = Args::parse();
    init_tracing(verbose)?;

    let mut cfg = Configuration::from_yaml_file(&config)
        .with_context(|| format!("failed to load configuration from {}", config.display()))?
        .validated()
        .context("invalid configuration values")?;
    if selection_seed.is_some() {
        cfg.slideshow.seed = selection_seed;
    }
    tracing::info!("Loaded configuration from {}:\n{:#?}", config.display(), cfg);

    let library = Arc::new(
        LibraryIndex::scan(&cfg.library.path)
            .with_context(|| format!("failed to scan {}", cfg.library.path.display()))?,
    );
    let settings = Arc::new(JsonSettingsStore::open(
        cfg.settings_path(),
        cfg.slideshow.default_interval,
    )?);
    let images: Arc<dyn ImageStore> = library.clone();
    let settings_store: Arc<dyn SettingsStore> = settings.clone();
    let filters = FilterEvaluator::new(images.clone(), settings_store.clone());

    if let Some(iterations) = selection_dry_run {
        return run_selection_dry_run(&cfg, &filters, settings_store.as_ref(), iterations);
    }

    let events = EventBroadcaster::new(cfg.events.queue_capacity);
    let transport: Arc<dyn FrameTransport> = match cfg.device.kind {
        DeviceKind::Websocket => Arc::new(WebSocketTransport::new(
            cfg.device.host.clone(),
            cfg.device.port,
        )),
        DeviceKind::Simulated => {
            tracing::warn!("using the simulated device; nothing will reach a real frame");
            ScriptedDevice::new().transport()
        }
    };
    let link = DeviceLink::new(transport, cfg.link_options(), events.clone());
    let cache = Arc::new(JsonUploadCache::open(cfg.upload_cache_path())?);
    let uploads = UploadCoordinator::new(link.clone(), images.clone(), cache, cfg.upload_options());
    let (scheduler, slideshow) = SlideshowScheduler::new(
        SchedulerDeps {
            link: link.clone(),
            uploads: uploads.clone(),
            filters,
            images,
            settings: settings_store.clone(),
            events: events.clone(),
        },
        cfg.scheduler_options(),
    );
    let cleaner = DeviceCleaner::new(
        link.clone(),
        uploads,
        settings_store.clone(),
        cfg.cleanup_options(),
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("ctrl-c handler failed: {err}");
                return;
            }
            tracing::info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    tasks.spawn(link.clone().run_supervisor(cancel.clone()));
    tasks.spawn(link.clone().run_health_probe(cancel.clone()));
    tasks.spawn(scheduler.run(cancel.clone()));
    tasks.spawn({
        let events = events.clone();
        let interval = cfg.events.heartbeat_interval;
        let cancel = cancel.clone();
        async move {
            events.run_heartbeat(interval, cancel).await;
            Ok(())
        }
    });
    if cfg.library.watch {
        tasks.spawn(library.clone().run_watch(cancel.clone()));
    }
    tasks.spawn(settings.clone().run_watch(cancel.clone()));
    tasks.spawn(cleaner.clone().run_periodic(cancel.clone()));
    tasks.spawn(web::serve(
        cfg.web.socket_addr(),
        ApiState {
            link: link.clone(),
            slideshow,
            settings: settings_store,
            events,
            cleaner,
        },
        cancel.clone(),
    ));

    link.connect();

    // Drain JoinSet (wait for all tasks to complete)
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("task error: {e:?}"),
            Err(e) => tracing::error!("join error: {e}"),
        }
    }

    Ok(())
}

fn run_selection_dry_run(
    cfg: &Configuration,
    filters: &FilterEvaluator,
    settings: &dyn SettingsStore,
    iterations: usize,
) -> Result<()> {
    let slideshow = settings.slideshow()?;
    let mut active = settings.active_art()?.map(|art| art.image_id);
    let eligible = filters
        .eligible(slideshow.filter.as_ref())
        .context("failed to evaluate the active filter")?;

    println!(
        "# selection dry run\n# policy: {:?}\n# filter: {}\n# eligible: {}\n# seed: {}\n",
        cfg.slideshow.selection,
        slideshow
            .filter
            .as_ref()
            .map_or_else(|| "(none)".to_string(), ToString::to_string),
        eligible.len(),
        cfg.slideshow
            .seed
            .map_or_else(|| "(random)".to_string(), |s| s.to_string())
    );

    if eligible.is_empty() {
        println!("(no eligible images under {})", cfg.library.path.display());
        return Ok(());
    }

    let mut rng = match cfg.slideshow.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    println!("# planned order:");
    for idx in 0..iterations {
        let Some(image) = choose_next(cfg.slideshow.selection, &mut rng, &eligible, active.as_ref())
        else {
            break;
        };
        println!("  {:>4}: {}", idx + 1, image.id);
        active = Some(image.id.clone());
    }
    Ok(())
}
