use clap::{Parser, Subcommand};
use ewfacq::acquisition::Acquisition;
use ewfacq::codec::CompressionLevel;
use ewfacq::device::{Device, RawDevice};
use ewfacq::options::{AcquisitionOptions, CaseMetadata, DEFAULT_CHUNK_SIZE, DEFAULT_SEGMENT_SIZE, DEFAULT_WORKERS};
use ewfacq::pipeline::{ProgressState, StopHandle};
use ewfacq::verify::verify_image;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;
use tracing::{error, warn};

#[derive(Parser)]
#[command(name = "ewfacq", version, about = "Forensic disk acquisition into EWF (E01) images")]
struct Cli {
    /// Debug-level logs with thread and source locations
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Image a device or raw file into a segmented E01 container
    Acquire {
        #[arg(short, long)]
        device: PathBuf,
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
        /// Base file name; segments get .E01, .E02, ... appended
        #[arg(short, long)]
        name: String,
        /// none, fast, balanced or best
        #[arg(short, long, default_value = "fast")]
        compression: CompressionLevel,
        #[arg(long, default_value_t = DEFAULT_SEGMENT_SIZE)]
        segment_size: u64,
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
        #[arg(short, long, default_value_t = DEFAULT_WORKERS)]
        workers: usize,
        /// Serial number recorded in the image when the device cannot report one
        #[arg(long)]
        serial: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value = "")]
        case_number: String,
        #[arg(long, default_value = "")]
        evidence_number: String,
        #[arg(long, default_value = "")]
        examiner: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "")]
        notes: String,
        #[arg(long)]
        no_md5: bool,
        #[arg(long)]
        no_sha1: bool,
        /// Also write <name>.json next to the image
        #[arg(long)]
        json_report: bool,
    },
    /// Re-read an image and check its checksums, tables and digests
    Verify {
        input: PathBuf,
    },
    /// Print segment and section layout plus volume metadata
    Info {
        input: PathBuf,
    },
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    ewfacq::logging::init(cli.verbose);

    match cli.command {

        // ── Acquire ──────────────────────────────────────────────────────────
        Commands::Acquire {
            device, output_dir, name, compression, segment_size, chunk_size, workers,
            serial, model, case_number, evidence_number, examiner, description, notes,
            no_md5, no_sha1, json_report,
        } => {
            let mut source = RawDevice::open(&device, serial)?;
            if let Some(model) = model {
                source = source.with_model(model);
            }
            let options = AcquisitionOptions {
                compression,
                output_dir,
                base_name: name,
                case: CaseMetadata { description, case_number, evidence_number, examiner, notes },
                chunk_size,
                segment_size,
                compression_workers: workers,
                md5: !no_md5,
                sha1: !no_sha1,
                json_report,
                ..AcquisitionOptions::default()
            };

            let acquisition = Acquisition::new(&source, &options)?;
            let progress = acquisition.progress();
            let total = source.size();
            let ticker = thread::spawn(move || {
                while progress.state() == ProgressState::Running {
                    thread::sleep(Duration::from_secs(2));
                    let done = progress.bytes_read();
                    if total > 0 && progress.state() == ProgressState::Running {
                        eprint!("\r  {:>6.2}%  {} / {} bytes", done as f64 * 100.0 / total as f64, done, total);
                    }
                }
                eprintln!();
            });

            stop_on_interrupt(acquisition.stop_handle());
            let report = acquisition.run()?;
            let _ = ticker.join();
            for line in report.lines() {
                println!("{line}");
            }
            if !report.is_complete() {
                return Ok(ExitCode::FAILURE);
            }
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { input } => {
            let report = verify_image(&input)?;
            println!("{}", report.summary());
            println!("MD5  {}", hex::encode_upper(&report.computed_md5));
            println!("SHA1 {}", hex::encode_upper(&report.computed_sha1));
            let problems = report.problems();
            for problem in &problems {
                println!("  ! {problem}");
            }
            if !problems.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input } => {
            let report = verify_image(&input)?;
            println!("── EWF image ────────────────────────────────────────────");
            println!("  Path           {}", input.display());
            println!("  Segments       {}", report.segments.len());
            if let Some(volume) = &report.volume {
                println!("  GUID           {}", volume.guid);
                println!("  Chunks         {}", volume.chunk_count);
                println!("  Sectors/chunk  {}", volume.sectors_per_chunk);
                println!("  Sector count   {}", volume.sector_count);
                println!("  Compression    {}", volume.compression_level);
            }
            if let Some(md5) = report.stored_md5 {
                println!("  Stored MD5     {}", hex::encode_upper(md5));
            }
            if let Some(sha1) = report.stored_sha1 {
                println!("  Stored SHA1    {}", hex::encode_upper(sha1));
            }
            for run in &report.error_runs {
                println!("  Bad run        {} (+{})", run.first, run.count);
            }
            println!("{:>4} {:>12} {:<10} {:>12}", "Seg", "Offset", "Section", "Size");
            for section in &report.sections {
                println!("{:>4} {:>12} {:<10} {:>12}", section.segment, section.offset, section.tag, section.size);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Ctrl-C stops the run cooperatively; the partial image is still closed and
/// the report printed.
fn stop_on_interrupt(stop: StopHandle) {
    let spawned = thread::Builder::new().name("signal-watch".into()).spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                error!("failed to build signal runtime: {e}");
                return;
            }
        };
        if let Err(e) = rt.block_on(tokio::signal::ctrl_c()) {
            error!("failed to listen for ctrl_c: {e}");
            return;
        }
        warn!("interrupt received, stopping acquisition");
        stop.stop();
    });
    if let Err(e) = spawned {
        error!("cannot watch for interrupts: {e}");
    }
}
