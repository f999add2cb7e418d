//! # Sonora CLI
//!
//! Command-line front end for Sonora. Every command runs both sides in one
//! process, connected by an in-memory loopback.
//!
//! ## Commands
//! - `import` - Upload a file into the asset store
//! - `list` - Print the asset catalog
//! - `fetch` - Download an asset into the local cache
//! - `play` - Stream a local file through the engine, on the null backend or
//!   the output device
//! - `simulate` - Drive the scheduler with a walking observer and print directives

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use sonora_assets::{AssetCache, AssetLocator};
use sonora_audio::{
    AudioBackend, Consumption, EngineSettings, NullBackend, StreamingEngine, SymphoniaOpener,
};
use sonora_core::{AssetId, BlockPos, ObserverId, SonoraConfig, TickClock, Vec3};
use sonora_server::{PlaybackScheduler, ServerEndpoint, SimulatedWorld, StateStore};
use sonora_transfer::{ClientMessage, Directive, DownloadClient, ServerMessage, UploadClient};

/// Sonora speaker audio CLI
#[derive(Parser)]
#[command(name = "sonora")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Data directory holding the store, channel state and cache
    #[arg(short, long, default_value = ".")]
    pub root: PathBuf,

    /// Configuration file (defaults to <root>/sonora.json when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Upload an audio file into the store
    Import {
        /// File to upload
        file: PathBuf,
    },

    /// List stored assets
    List,

    /// Download a stored asset into the local cache
    Fetch {
        /// Asset id as printed by `list`
        id: AssetId,
    },

    /// Stream a local file through the engine
    Play {
        /// Audio file to decode
        file: PathBuf,

        /// Seconds to let it play
        #[arg(short, long, default_value = "5")]
        seconds: f64,

        /// Join offset in seconds
        #[arg(short, long, default_value = "0")]
        offset: f64,

        /// Loop at end of stream
        #[arg(long = "loop")]
        looping: bool,

        /// Play on the default output device instead of the null backend
        #[arg(long)]
        device: bool,
    },

    /// Walk an observer past a powered speaker and print every directive
    Simulate {
        /// Ticks to simulate
        #[arg(short, long, default_value = "200")]
        ticks: u32,

        /// Blocks the observer moves per tick
        #[arg(long, default_value = "1.0")]
        speed: f32,

        /// Write channel state to the configured state file
        #[arg(long)]
        persist: bool,

        /// Pace ticks against the wall clock instead of running flat out
        #[arg(long)]
        realtime: bool,
    },
}

/// Server and consumer wired back to back
pub struct Loopback {
    pub endpoint: ServerEndpoint,
    pub scheduler: PlaybackScheduler,
    pub sender: ObserverId,
}

impl Loopback {
    /// Open the store under `root`
    pub fn open(root: &Path, config: &SonoraConfig, states: Arc<StateStore>) -> Result<Self> {
        let endpoint = ServerEndpoint::open(root, &config.server)
            .with_context(|| format!("opening asset store under {}", root.display()))?;
        Ok(Self {
            endpoint,
            scheduler: PlaybackScheduler::new(states, &config.server),
            sender: ObserverId::new_random(),
        })
    }

    /// Deliver one message and collect the replies addressed to the sender
    pub fn send(&mut self, message: ClientMessage) -> Vec<ServerMessage> {
        let mut replies: Vec<ServerMessage> = Vec::new();
        let mut directives: Vec<(ObserverId, Directive)> = Vec::new();
        self.endpoint.handle(
            self.sender,
            message,
            &mut self.scheduler,
            &mut replies,
            &mut directives,
        );
        replies
    }

    /// Upload a file; returns the stored display name
    pub fn upload(&mut self, path: &Path) -> Result<String> {
        let (mut upload, request) =
            UploadClient::from_path(path).with_context(|| format!("reading {}", path.display()))?;

        let mut replies = self.send(request);
        let Some(ServerMessage::ResponseUpload {
            approved,
            max_chunk,
            reason,
            ..
        }) = replies.pop()
        else {
            bail!("store did not answer the upload request");
        };
        upload.on_response(approved, max_chunk, reason)?;

        let mut ack = None;
        while let Some(chunk) = upload.next_chunk()? {
            if let Some(reply) = self.send(chunk).pop() {
                ack = Some(reply);
            }
        }

        match ack {
            Some(ServerMessage::Acknowledge {
                success,
                display_name,
                reason,
                ..
            }) => Ok(upload.on_acknowledge(success, display_name, reason)?),
            _ => bail!("store did not acknowledge the upload"),
        }
    }

    /// Download an asset into `downloads`; returns the cached path
    pub fn download(&mut self, id: AssetId, downloads: &DownloadClient) -> Result<PathBuf> {
        let Some(request) = downloads.request(id) else {
            return downloads
                .cache()
                .resolve(&id)
                .ok_or_else(|| anyhow!("download of {} already in flight", id));
        };

        for reply in self.send(request) {
            match reply {
                ServerMessage::AssetChunk { id, bytes, is_last } => {
                    if let Some(path) = downloads.accept_chunk(id, bytes, is_last)? {
                        return Ok(path);
                    }
                }
                ServerMessage::AssetUnavailable { id } => {
                    downloads.abandon(&id);
                    bail!("asset {} is not in the store", id);
                }
                other => log::debug!("Ignoring {} during download", other.kind()),
            }
        }
        bail!("download of {} ended without a last chunk", id)
    }
}

/// Serves exactly one local file under a fixed id
struct LocalFile {
    id: AssetId,
    path: PathBuf,
}

impl AssetLocator for LocalFile {
    fn locate(&self, id: &AssetId) -> Option<PathBuf> {
        (*id == self.id).then(|| self.path.clone())
    }
}

fn load_config(cli: &Cli) -> Result<SonoraConfig> {
    let config = match &cli.config {
        Some(path) => SonoraConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => SonoraConfig::load_or_default(cli.root.join("sonora.json"))?,
    };
    Ok(config)
}

/// Execute the CLI command
pub fn execute(cli: Cli) -> Result<()> {
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let config = load_config(&cli)?;
    let root = cli.root.as_path();

    match cli.command {
        Commands::Import { file } => {
            let mut link = Loopback::open(root, &config, Arc::new(StateStore::in_memory()))?;
            let name = link.upload(&file)?;
            log::info!("Imported '{}'", name);
        }

        Commands::List => {
            let link = Loopback::open(root, &config, Arc::new(StateStore::in_memory()))?;
            let catalog = link.endpoint.catalog();
            if catalog.is_empty() {
                log::info!("Store is empty");
            }
            for asset in catalog {
                println!("{}  {}", asset.id, asset.display_name);
            }
        }

        Commands::Fetch { id } => {
            let mut link = Loopback::open(root, &config, Arc::new(StateStore::in_memory()))?;
            let cache = AssetCache::open(root.join(&config.client.cache_dir))?;
            let path = link.download(id, &DownloadClient::new(cache))?;
            log::info!("Cached {} at {}", id, path.display());
        }

        Commands::Play {
            file,
            seconds,
            offset,
            looping,
            device,
        } => play(&config, file, seconds, offset, looping, device)?,

        Commands::Simulate {
            ticks,
            speed,
            persist,
            realtime,
        } => {
            let states = if persist {
                StateStore::open(root.join(&config.server.state_file))?
            } else {
                StateStore::in_memory()
            };
            let link = Loopback::open(root, &config, Arc::new(states))?;
            simulate(link, ticks, speed, realtime)?;
        }
    }

    Ok(())
}

fn play(
    config: &SonoraConfig,
    file: PathBuf,
    seconds: f64,
    offset: f64,
    looping: bool,
    device: bool,
) -> Result<()> {
    if !file.is_file() {
        bail!("{} is not a file", file.display());
    }

    let id = AssetId::new_random();
    let null = Arc::new(NullBackend::new(Consumption::RealTime));
    let backend: Arc<dyn AudioBackend> = if device { open_device()? } else { null.clone() };
    let engine = StreamingEngine::new(
        backend,
        Arc::new(SymphoniaOpener),
        Arc::new(LocalFile { id, path: file.clone() }),
        EngineSettings::from(&config.client),
    )?;

    let position = BlockPos::ORIGIN;
    engine.play(position, id, offset, looping)?;
    log::info!("Playing {} for {:.1}s", file.display(), seconds);

    let deadline = Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
    while Instant::now() < deadline {
        engine.poll(position.center());
        if !engine.is_active(position) {
            log::info!("Stream ended before the deadline");
            break;
        }
        std::thread::sleep(config.client.poll_interval());
    }

    engine.stop_all();
    engine.wait_idle();

    if !device {
        let stats = null.stats();
        println!(
            "uploaded {} buffers ({} bytes), {} plays, {} sources leaked",
            stats.uploads,
            stats.bytes_uploaded,
            stats.plays,
            stats.live_sources()
        );
    }
    Ok(())
}

#[cfg(feature = "device")]
fn open_device() -> Result<Arc<dyn AudioBackend>> {
    let backend = sonora_audio::CpalBackend::open().context("opening the default output device")?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "device"))]
fn open_device() -> Result<Arc<dyn AudioBackend>> {
    bail!("built without audio output; rebuild with `--features device`")
}

fn simulate(mut link: Loopback, ticks: u32, speed: f32, realtime: bool) -> Result<()> {
    let range = link.scheduler.range();
    let speaker = BlockPos::new(0, 64, 0);
    let walker = ObserverId::new_random();

    let (asset_id, name) = match link.endpoint.catalog().into_iter().next() {
        Some(asset) => (asset.id, asset.display_name),
        None => (AssetId::new_random(), String::from("placeholder.ogg")),
    };

    let mut world = SimulatedWorld::new();
    let mut directives: Vec<(ObserverId, Directive)> = Vec::new();
    link.scheduler.bind_speaker(speaker)?;
    link.scheduler.assign_asset(speaker, asset_id, &name, &mut directives)?;
    world.place(speaker);

    let power_on = 5;
    let end = i64::from(ticks);
    let power_off = end * 3 / 4;
    let start_x = -(range + 8.0);
    let rate = link.scheduler.rate();
    let mut clock = TickClock::new(rate);
    let mut last = Instant::now();

    while clock.now() < end {
        let due = if realtime {
            std::thread::sleep(rate.step());
            let wall = Instant::now();
            let ran = i64::from(clock.advance(wall - last));
            last = wall;
            (clock.now() - ran + 1)..=clock.now()
        } else {
            let now = clock.tick();
            now..=now
        };

        for now in due {
            if now == power_on {
                world.set_powered(speaker, true);
                println!("[tick {:>4}] speaker powered", now);
            }
            if now == power_off {
                world.set_powered(speaker, false);
                println!("[tick {:>4}] speaker unpowered", now);
            }

            let x = start_x + speed * now as f32;
            world.move_observer(walker, Vec3::new(x, 64.5, 0.5));
            link.scheduler.tick(now, &world, &mut directives);
            link.endpoint.uploads().expire_idle();

            for (observer, directive) in directives.drain(..) {
                println!("[tick {:>4}] x={:>7.1} {} <- {:?}", now, x, observer, directive);
            }
        }
    }

    link.scheduler.stop_all_observers(&mut directives);
    for (observer, directive) in directives.drain(..) {
        println!("[shutdown ] {} <- {:?}", observer, directive);
    }
    Ok(())
}
