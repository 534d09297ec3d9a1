use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use clap::{ArgAction, Parser, ValueEnum};
use log::{debug, error, info, warn, LevelFilter};
use macaddr::MacAddr6;

use nic_engine::sim::SimulatedAdapter;
use nic_engine::{EngineConfig, ErrorCode, NicContext, TransferError};

use crate::traffic::{split, FrameBuilder, TrafficCounters, VerifyingSink, MIN_FRAME};

mod traffic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AdapterMode {
    /// Descriptor rings serviced by bus-master DMA
    Busmaster,
    /// Frames moved through the adapter FIFO by the CPU
    Pio,
}

#[derive(Parser, Debug)]
#[command(long_about = "")] // long_about required for long help, otherwise help is always short
struct Args {
    /// Kind of adapter to simulate
    #[arg(short, long, value_enum, default_value_t = AdapterMode::Busmaster)]
    adapter: AdapterMode,

    /// Number of frames to send through the loopback
    #[arg(short, long, default_value_t = 1000)]
    packets: u32,

    /// Largest generated frame in bytes
    #[arg(long, default_value_t = 1514)]
    max_frame: u16,

    /// Split every frame into this many fragments, more than one forces consolidation
    #[arg(short, long, default_value_t = 1)]
    fragments: u8,

    /// Corrupt every n-th received frame with a CRC error, 0 disables
    #[arg(short, long, default_value_t = 0)]
    error_every: u32,

    /// Consecutive errors that trigger recovery
    #[arg(long, default_value_t = 5)]
    consecutive_threshold: u32,

    /// Error rate in percent that triggers recovery
    #[arg(long, default_value_t = 10)]
    rate_threshold: u32,

    /// Lower the events handled per interrupt
    #[arg(short, long)]
    work_limit: Option<u16>,

    /// Source ethernet address of generated frames
    // Default mac x2-... is in locally administered range and
    // should hopefully not conflict with anything
    #[arg(short, long, default_value_t = MacAddr6::new(0x02, 0x34, 0x56, 0x78, 0x9A, 0xBC))]
    mac: MacAddr6,

    /// Increase verbosity, 1 time => Debug logs, multiple times => Trace logs
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();

    pretty_env_logger::formatted_builder()
        .filter_level(match args.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        })
        .parse_default_env() // Overwrite from RUST_LOG env var
        .init();

    let adapter = match args.adapter {
        AdapterMode::Busmaster => SimulatedAdapter::busmaster(),
        AdapterMode::Pio => SimulatedAdapter::programmed_io(),
    };
    adapter.set_loopback(true);

    let config = EngineConfig {
        consecutive_threshold: args.consecutive_threshold,
        rate_threshold_percent: args.rate_threshold,
        work_limit_override: args.work_limit,
        ..Default::default()
    };

    let counters = Arc::new(TrafficCounters::default());
    let sink = VerifyingSink {
        counters: counters.clone(),
    };
    let nic = match NicContext::new(adapter, config, Box::new(sink)) {
        Ok(nic) => nic,
        Err(e) => {
            error!("Failed to set up engine: {}", e);
            std::process::exit(1);
        }
    };

    info!("Running {} frames through {:?} adapter...", args.packets, args.adapter);
    let start = Instant::now();
    let max_frame = (args.max_frame as usize).max(MIN_FRAME + 1);
    let mut builder = FrameBuilder::new(args.mac);
    let mut sent = 0u64;
    let mut busy = 0u64;

    'sending: for i in 0..args.packets {
        let length = MIN_FRAME + (i as usize * 37) % (max_frame - MIN_FRAME);
        let frame = builder.build(length);
        let whole = match nic.hw.host_buffer(&frame) {
            Ok(whole) => whole,
            Err(e) => {
                error!("Host memory: {}", e);
                break;
            }
        };
        let fragments = split(whole, args.fragments);

        if args.error_every != 0 && i % args.error_every == args.error_every - 1 {
            nic.hw.queue_rx_errors(ErrorCode::CRC, 1);
        }

        // Retry once after draining if the ring is full
        for attempt in 0..2 {
            match nic.send(&fragments) {
                Ok(()) => {
                    sent += 1;
                    break;
                }
                Err(TransferError::Busy) if attempt == 0 => {
                    busy += 1;
                    nic.poll_and_drain();
                }
                Err(TransferError::Fatal) => {
                    warn!("Adapter disabled after {} frames", i);
                    break 'sending;
                }
                Err(e) => {
                    debug!("Dropping frame {}: {}", i, e);
                    break;
                }
            }
        }

        if nic.hw.take_interrupt() {
            nic.on_interrupt();
        }
        nic.hw.advance_ms(1);

        // Zero-copy frames reference host memory until their descriptor is reaped
        if nic.get_stats().tx_ring.occupancy == 0 {
            nic.hw.reset_host_buffers();
        }
    }

    // Collect whatever is still in flight
    while nic.poll_and_drain() != 0 {}

    let elapsed = start.elapsed().as_secs_f32();
    info!("Statistics:");
    for line in nic.get_stats().to_string().lines() {
        info!("{}", line);
    }
    for entry in nic.recent_errors().iter().rev().take(5) {
        debug!("Recent error: {:?}", entry);
    }
    info!(
        "{} frames sent ({} busy retries), {} received, {}B total, {} corrupt, {} caller buffers released",
        sent,
        busy,
        counters.frames.load(Ordering::Relaxed),
        counters.bytes.load(Ordering::Relaxed),
        counters.corrupt.load(Ordering::Relaxed),
        counters.released.load(Ordering::Relaxed)
    );

    let leaked = nic.shutdown().outstanding;
    info!("Exiting after {:.3}s run time.", elapsed);
    if leaked != 0 {
        error!("{} buffers leaked", leaked);
        std::process::exit(1);
    }
}
